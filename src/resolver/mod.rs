//! Selector resolution.
//!
//! A selector is either a literal datasource key or, when it starts with
//! [`DYNAMIC_PREFIX`], a dynamic selector resolved against the invocation by
//! an ordered chain of [`SelectorHandler`]s:
//!
//! 1. [`HeaderHandler`]: `#header.<name>`, an inbound request header
//! 2. [`SessionHandler`]: `#session.<name>`, an inbound session attribute
//! 3. [`ExpressionHandler`]: anything else, through an [`ExpressionEvaluator`]
//!
//! Handlers that do not apply, or whose source has no value, pass the
//! selector on. The expression handler is terminal: it resolves or fails.

mod expression;
mod header;
mod session;

pub use expression::{
    ExpressionEvaluator, ExpressionHandler, NameResolver, NoComponents, PathExpressionEvaluator,
};
pub use header::HeaderHandler;
pub use session::SessionHandler;

use crate::error::{DbError, DbResult};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Marks a selector as dynamic.
pub const DYNAMIC_PREFIX: char = '#';

/// What a selector is resolved against: the intercepted operation, its
/// receiver, its arguments and the inbound request.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    /// Name of the operation being invoked
    pub operation: String,
    /// Receiver type or instance name
    pub target: Option<String>,
    /// Declared metadata on the operation
    pub metadata: HashMap<String, String>,
    /// Named arguments of the invocation
    pub arguments: Map<String, Value>,
    /// Request headers, keyed by lowercase name
    headers: HashMap<String, String>,
    /// Session attributes
    session: HashMap<String, String>,
}

impl InvocationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_session(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.session.insert(name.into(), value.into());
        self
    }

    /// Header value, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn session_attribute(&self, name: &str) -> Option<&str> {
        self.session.get(name).map(String::as_str)
    }
}

/// One link of the resolution chain.
pub trait SelectorHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Resolve `selector`, or return `Ok(None)` to pass it to the next link.
    ///
    /// Must not mutate shared state.
    fn try_resolve(&self, selector: &str, ctx: &InvocationContext) -> DbResult<Option<String>>;
}

/// Strip `#<source>` plus one separator from `selector`, returning the
/// attribute name. `None` when the selector targets another source.
pub(crate) fn strip_source<'a>(selector: &'a str, source: &str) -> Option<&'a str> {
    let rest = selector.strip_prefix(DYNAMIC_PREFIX)?.strip_prefix(source)?;
    let mut chars = rest.chars();
    match chars.next() {
        Some(sep) if !sep.is_alphanumeric() && sep != '_' => {
            let name = chars.as_str();
            (!name.is_empty()).then_some(name)
        }
        _ => None,
    }
}

/// Ordered chain of selector handlers.
pub struct KeyResolver {
    handlers: Vec<Box<dyn SelectorHandler>>,
}

impl std::fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.handlers.iter().map(|h| h.name()).collect();
        f.debug_struct("KeyResolver").field("handlers", &names).finish()
    }
}

impl KeyResolver {
    /// Build a resolver from explicit handlers, tried in the given order.
    pub fn new(handlers: Vec<Box<dyn SelectorHandler>>) -> Self {
        Self { handlers }
    }

    /// The standard header, session, expression chain, with `names` available
    /// to expressions.
    pub fn with_components(names: Arc<dyn NameResolver>) -> Self {
        Self::new(vec![
            Box::new(HeaderHandler),
            Box::new(SessionHandler),
            Box::new(ExpressionHandler::new(PathExpressionEvaluator, names)),
        ])
    }

    /// Turn `selector` into a datasource key.
    ///
    /// Literal selectors come back unchanged without consulting any handler.
    pub fn resolve(&self, selector: &str, ctx: &InvocationContext) -> DbResult<String> {
        if !selector.starts_with(DYNAMIC_PREFIX) {
            return Ok(selector.to_string());
        }

        for handler in &self.handlers {
            if let Some(key) = handler.try_resolve(selector, ctx)? {
                debug!(selector = %selector, handler = handler.name(), key = %key, "Selector resolved");
                return Ok(key);
            }
        }

        Err(DbError::unresolvable_selector(
            selector,
            "no resolver in the chain produced a key",
        ))
    }
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::with_components(Arc::new(NoComponents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl SelectorHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn try_resolve(&self, _selector: &str, _ctx: &InvocationContext) -> DbResult<Option<String>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[test]
    fn test_strip_source() {
        assert_eq!(strip_source("#header.tenant", "header"), Some("tenant"));
        assert_eq!(strip_source("#header:X-Tenant", "header"), Some("X-Tenant"));
        assert_eq!(strip_source("#header.", "header"), None);
        assert_eq!(strip_source("#headers", "header"), None);
        assert_eq!(strip_source("#session.tenant", "header"), None);
        assert_eq!(strip_source("header.tenant", "header"), None);
    }

    #[test]
    fn test_literal_never_consults_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = KeyResolver::new(vec![Box::new(Counting(calls.clone()))]);
        let ctx = InvocationContext::new("find");
        for literal in ["master", "slave_1", "", "a#b"] {
            assert_eq!(resolver.resolve(literal, &ctx).unwrap(), literal);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unhandled_dynamic_selector_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = KeyResolver::new(vec![Box::new(Counting(calls.clone()))]);
        let err = resolver
            .resolve("#tenant", &InvocationContext::new("find"))
            .unwrap_err();
        assert!(matches!(err, DbError::UnresolvableSelector { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_chain_order() {
        let ctx = InvocationContext::new("find")
            .with_header("Tenant", "from_header")
            .with_session("tenant", "from_session")
            .with_argument("tenant", "from_arg");
        let resolver = KeyResolver::default();
        assert_eq!(resolver.resolve("#header.tenant", &ctx).unwrap(), "from_header");
        assert_eq!(resolver.resolve("#session.tenant", &ctx).unwrap(), "from_session");
        assert_eq!(resolver.resolve("#tenant", &ctx).unwrap(), "from_arg");
    }

    #[test]
    fn test_missing_header_falls_through_to_expression() {
        let ctx = InvocationContext::new("find").with_argument("header", json!({"tenant": "arg"}));
        let resolver = KeyResolver::default();
        assert_eq!(resolver.resolve("#header.tenant", &ctx).unwrap(), "arg");
    }

    #[test]
    fn test_reordering_disjoint_handlers_keeps_result() {
        let ctx = InvocationContext::new("find")
            .with_header("x-ds", "slave_1")
            .with_session("ds", "slave_2");
        let forward = KeyResolver::new(vec![Box::new(HeaderHandler), Box::new(SessionHandler)]);
        let reversed = KeyResolver::new(vec![Box::new(SessionHandler), Box::new(HeaderHandler)]);
        for selector in ["#header.X-DS", "#session.ds"] {
            assert_eq!(
                forward.resolve(selector, &ctx).unwrap(),
                reversed.resolve(selector, &ctx).unwrap()
            );
        }
    }
}
