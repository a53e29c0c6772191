use super::{InvocationContext, SelectorHandler, strip_source};
use crate::error::DbResult;

/// Resolves `#session.<name>` from the inbound session attributes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionHandler;

impl SelectorHandler for SessionHandler {
    fn name(&self) -> &'static str {
        "session"
    }

    fn try_resolve(&self, selector: &str, ctx: &InvocationContext) -> DbResult<Option<String>> {
        Ok(strip_source(selector, "session")
            .and_then(|name| ctx.session_attribute(name))
            .filter(|value| !value.is_empty())
            .map(String::from))
    }
}
