//! Per-execution-context state: the datasource selection stack and the
//! local transaction binding.
//!
//! State lives in a tokio task-local when the caller runs inside [`scope`] or
//! [`scoped`], so it follows the task across worker threads. Outside any task
//! scope it lives in a thread-local created lazily on first use, which is what
//! synchronous callers and `current_thread` runtimes see.
//!
//! Nothing here is shared between contexts, so no locking is involved.

use crate::tx::TransactionState;
use std::cell::RefCell;
use std::future::Future;
use tracing::debug;

/// Ordered stack of resolved datasource keys for one execution context.
///
/// The top entry is the current key. An inner scope's key shadows the outer
/// one until the inner scope pops it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionStack {
    keys: Vec<String>,
}

impl SelectionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>) {
        self.keys.push(key.into());
    }

    /// Remove the most recently pushed key. No-op when empty.
    pub fn pop(&mut self) -> Option<String> {
        self.keys.pop()
    }

    pub fn peek(&self) -> Option<&str> {
        self.keys.last().map(String::as_str)
    }

    /// Current key, or `default` outside any selection scope.
    pub fn peek_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.peek().unwrap_or(default)
    }

    pub fn depth(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

#[derive(Debug, Default)]
pub(crate) struct ExecutionContext {
    pub(crate) selection: SelectionStack,
    pub(crate) transaction: TransactionState,
}

tokio::task_local! {
    static TASK_CONTEXT: RefCell<ExecutionContext>;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<ExecutionContext> = RefCell::new(ExecutionContext::default());
}

/// Whether the caller runs inside a task-bound context.
pub fn in_task_scope() -> bool {
    TASK_CONTEXT.try_with(|_| ()).is_ok()
}

/// Run `f` against the context of the current task, or of the current thread
/// when no task scope is active.
///
/// `f` must not re-enter this function.
pub(crate) fn with_context<R>(f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
    if in_task_scope() {
        TASK_CONTEXT.with(|cell| f(&mut cell.borrow_mut()))
    } else {
        THREAD_CONTEXT.with(|cell| f(&mut cell.borrow_mut()))
    }
}

/// Run `fut` with a fresh, empty context bound to it.
///
/// Use this at the root of every independent unit of work (request handler,
/// spawned task) so its selection stack and transaction never leak into
/// another one.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    TASK_CONTEXT
        .scope(RefCell::new(ExecutionContext::default()), fut)
        .await
}

/// Run `fut` in the enclosing task context.
///
/// Outside any task scope the current thread's context is moved into a task
/// scope for the duration of `fut` and written back once it completes, so
/// keys pushed and transactions bound on the thread stay visible to `fut` and
/// anything `fut` leaves bound stays visible afterwards. If `fut` is dropped
/// before completing, the thread context is reset to empty.
pub async fn scoped<F: Future>(fut: F) -> F::Output {
    if in_task_scope() {
        return fut.await;
    }

    let ctx = THREAD_CONTEXT.with(|cell| std::mem::take(&mut *cell.borrow_mut()));
    let (output, ctx) = TASK_CONTEXT
        .scope(RefCell::new(ctx), async {
            let output = fut.await;
            let ctx = TASK_CONTEXT.with(|cell| std::mem::take(&mut *cell.borrow_mut()));
            (output, ctx)
        })
        .await;
    THREAD_CONTEXT.with(|cell| *cell.borrow_mut() = ctx);
    output
}

/// Push a resolved key onto the current context's selection stack.
pub fn push(key: impl Into<String>) {
    let key = key.into();
    with_context(|ctx| {
        debug!(key = %key, depth = ctx.selection.depth() + 1, "Push datasource key");
        ctx.selection.push(key);
    });
}

/// Current key, if any selection scope is active.
pub fn peek() -> Option<String> {
    with_context(|ctx| ctx.selection.peek().map(String::from))
}

/// Current key, or `default` outside any selection scope.
pub fn peek_or(default: &str) -> String {
    with_context(|ctx| ctx.selection.peek_or(default).to_string())
}

/// Pop the current key. Popping an empty stack is a no-op.
pub fn pop() -> Option<String> {
    with_context(|ctx| {
        let key = ctx.selection.pop();
        debug!(key = ?key, depth = ctx.selection.depth(), "Pop datasource key");
        key
    })
}

pub fn depth() -> usize {
    with_context(|ctx| ctx.selection.depth())
}

/// Empty the selection stack of the current context.
pub fn clear() {
    with_context(|ctx| ctx.selection.clear());
}

/// Push `key` and return a guard that pops it when dropped.
///
/// The pop happens on every exit path: normal return, `?` propagation, panic
/// unwinding and future cancellation.
pub fn enter(key: impl Into<String>) -> SelectionGuard {
    push(key);
    SelectionGuard { _private: () }
}

/// Pops one selection on drop. See [`enter`].
#[must_use = "the key is popped as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SelectionGuard {
    _private: (),
}

impl Drop for SelectionGuard {
    fn drop(&mut self) {
        pop();
    }
}
