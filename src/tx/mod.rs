//! Local transactions spanning several physical connections.
//!
//! A logical transaction is identified by an xid bound to the execution
//! context. Every connection acquired while it is bound is registered under
//! it and finalized together, without two-phase commit: a failure part way
//! through is reported, not undone.

mod coordinator;
mod propagation;
mod state;

pub use coordinator::{ExitError, LocalTransactionCoordinator, ScopeKind, TxScope};
pub use propagation::{Propagation, ScopeOutcome, TxOptions};
pub(crate) use state::TransactionState;
