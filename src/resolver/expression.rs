//! Expression link of the resolution chain.
//!
//! The evaluator is pluggable. The built-in [`PathExpressionEvaluator`]
//! understands property paths:
//!
//! - `#arg` / `#arg.field.0.name`: a named invocation argument, then object
//!   fields or array indexes
//! - `#@component` / `#@component.field`: a process-wide component looked up
//!   by name through a [`NameResolver`]
//!
//! The path must end on a string, number or boolean.

use super::{DYNAMIC_PREFIX, InvocationContext, SelectorHandler};
use crate::error::{DbError, DbResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Looks up process-wide components by name.
pub trait NameResolver: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Value>;
}

/// A name resolver that knows no components.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoComponents;

impl NameResolver for NoComponents {
    fn lookup(&self, _name: &str) -> Option<Value> {
        None
    }
}

impl NameResolver for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Evaluates a dynamic selector to a datasource key.
pub trait ExpressionEvaluator: Send + Sync {
    /// `expression` is the full selector, prefix included.
    fn evaluate(
        &self,
        expression: &str,
        ctx: &InvocationContext,
        names: &dyn NameResolver,
    ) -> DbResult<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PathExpressionEvaluator;

impl ExpressionEvaluator for PathExpressionEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        ctx: &InvocationContext,
        names: &dyn NameResolver,
    ) -> DbResult<String> {
        let fail = |reason: String| DbError::unresolvable_selector(expression, reason);

        let body = expression.strip_prefix(DYNAMIC_PREFIX).unwrap_or(expression);
        let (component, body) = match body.strip_prefix('@') {
            Some(rest) => (true, rest),
            None => (false, body),
        };

        let mut segments = body.split('.');
        let root_name = segments.next().unwrap_or_default();
        if root_name.is_empty() {
            return Err(fail("empty expression".to_string()));
        }

        let root = if component {
            names
                .lookup(root_name)
                .ok_or_else(|| fail(format!("no component named '{}'", root_name)))?
        } else {
            ctx.arguments
                .get(root_name)
                .cloned()
                .ok_or_else(|| fail(format!("no argument named '{}'", root_name)))?
        };

        let mut current = &root;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| fail(format!("path segment '{}' not found", segment)))?;
        }

        let key = match current {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => return Err(fail("expression evaluated to null".to_string())),
            Value::Array(_) | Value::Object(_) => {
                return Err(fail("expression must evaluate to a scalar".to_string()));
            }
        };

        if key.is_empty() {
            return Err(fail("expression evaluated to an empty key".to_string()));
        }
        Ok(key)
    }
}

/// Terminal link: evaluates any dynamic selector or fails.
pub struct ExpressionHandler {
    evaluator: Box<dyn ExpressionEvaluator>,
    names: Arc<dyn NameResolver>,
}

impl ExpressionHandler {
    pub fn new(evaluator: impl ExpressionEvaluator + 'static, names: Arc<dyn NameResolver>) -> Self {
        Self {
            evaluator: Box::new(evaluator),
            names,
        }
    }
}

impl SelectorHandler for ExpressionHandler {
    fn name(&self) -> &'static str {
        "expression"
    }

    fn try_resolve(&self, selector: &str, ctx: &InvocationContext) -> DbResult<Option<String>> {
        self.evaluator
            .evaluate(selector, ctx, self.names.as_ref())
            .map(Some)
    }
}
