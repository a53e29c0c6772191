//! Per-execution-context transaction binding.

use crate::context;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ActiveTx {
    pub(crate) xid: String,
    /// Open scopes participating in `xid`, the beginning one included
    pub(crate) depth: usize,
    /// Set once, never cleared
    pub(crate) rollback_only: bool,
}

impl ActiveTx {
    pub(crate) fn new(xid: String) -> Self {
        Self {
            xid,
            depth: 1,
            rollback_only: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TransactionState {
    pub(crate) active: Option<ActiveTx>,
    /// Bindings set aside by REQUIRES_NEW and NOT_SUPPORTED scopes
    pub(crate) suspended: Vec<Option<ActiveTx>>,
    /// Ids of open scopes, innermost last
    pub(crate) open_scopes: Vec<u64>,
}

impl TransactionState {
    pub(crate) fn suspend(&mut self) {
        let current = self.active.take();
        self.suspended.push(current);
    }

    pub(crate) fn resume(&mut self) {
        self.active = self.suspended.pop().flatten();
    }
}

/// Run `f` against the transaction state of the current execution context.
pub(crate) fn with_state<R>(f: impl FnOnce(&mut TransactionState) -> R) -> R {
    context::with_context(|ctx| f(&mut ctx.transaction))
}
