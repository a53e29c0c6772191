use super::{InvocationContext, SelectorHandler, strip_source};
use crate::error::DbResult;

/// Resolves `#header.<name>` from the inbound request headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderHandler;

impl SelectorHandler for HeaderHandler {
    fn name(&self) -> &'static str {
        "header"
    }

    fn try_resolve(&self, selector: &str, ctx: &InvocationContext) -> DbResult<Option<String>> {
        Ok(strip_source(selector, "header")
            .and_then(|name| ctx.header(name))
            .filter(|value| !value.is_empty())
            .map(String::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_case_insensitive() {
        let ctx = InvocationContext::new("find").with_header("X-Tenant", "slave_1");
        assert_eq!(
            HeaderHandler.try_resolve("#header.x-tenant", &ctx).unwrap(),
            Some("slave_1".to_string())
        );
    }

    #[test]
    fn test_header_passes_when_absent_or_empty() {
        let ctx = InvocationContext::new("find").with_header("empty", "");
        assert_eq!(HeaderHandler.try_resolve("#header.missing", &ctx).unwrap(), None);
        assert_eq!(HeaderHandler.try_resolve("#header.empty", &ctx).unwrap(), None);
        assert_eq!(HeaderHandler.try_resolve("#session.missing", &ctx).unwrap(), None);
    }
}
