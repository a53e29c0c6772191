//! Local transaction coordinator.
//!
//! Binds at most one transaction id (xid) to each execution context and
//! decides, per propagation mode, whether a scope begins, joins, nests into or
//! suspends it. Only the scope that began an xid finalizes it through the
//! [`ConnectionRegistry`]; joined scopes just leave, and a rollback anywhere in
//! the xid marks it rollback-only.

use super::propagation::{Propagation, ScopeOutcome, TxOptions};
use super::state::{ActiveTx, with_state};
use crate::db::{ConnectionRegistry, FinalizeReport};
use crate::error::{DbError, DbResult};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

static SCOPE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Generate a transaction id: a random v4 UUID.
fn generate_xid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// What entering a scope did to the execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeKind {
    /// Bound a new xid. `resumes` restores the suspended binding on exit.
    Begun { xid: String, resumes: bool },
    /// Joined the bound xid.
    Joined { xid: String },
    /// Opened a savepoint level in the bound xid.
    Nested { xid: String },
    /// Set the bound xid aside and runs without one.
    Suspended,
    /// Runs without an xid, nothing to undo.
    NonTransactional,
}

/// An open transactional scope. Hand it back to
/// [`LocalTransactionCoordinator::exit`].
#[must_use = "a transactional scope must be exited"]
#[derive(Debug)]
pub struct TxScope {
    id: u64,
    propagation: Propagation,
    kind: ScopeKind,
}

impl TxScope {
    pub fn kind(&self) -> &ScopeKind {
        &self.kind
    }

    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    pub fn xid(&self) -> Option<&str> {
        match &self.kind {
            ScopeKind::Begun { xid, .. } | ScopeKind::Joined { xid } | ScopeKind::Nested { xid } => {
                Some(xid)
            }
            ScopeKind::Suspended | ScopeKind::NonTransactional => None,
        }
    }
}

/// Error from [`LocalTransactionCoordinator::exit`].
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ExitError {
    pub error: DbError,
    /// The refused scope, when nothing was changed. Exit it again once the
    /// scopes entered after it have exited.
    pub scope: Option<TxScope>,
}

impl From<ExitError> for DbError {
    fn from(e: ExitError) -> Self {
        e.error
    }
}

enum Finalize {
    Transaction(String, bool),
    Savepoint(String, bool),
}

/// Unwinds a scope whose unit of work was dropped before it completed.
///
/// The context binding is undone with rollback intent. A begun xid is
/// unbound and its connections are rolled back on a spawned task.
struct PendingScope {
    id: u64,
    kind: ScopeKind,
    registry: ConnectionRegistry,
    armed: bool,
}

impl PendingScope {
    fn new(scope: &TxScope, registry: ConnectionRegistry) -> Self {
        Self {
            id: scope.id,
            kind: scope.kind.clone(),
            registry,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingScope {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.id;
        let kind = &self.kind;
        with_state(|state| {
            if let Some(pos) = state.open_scopes.iter().rposition(|open| *open == id) {
                state.open_scopes.remove(pos);
            }
            match kind {
                ScopeKind::Begun { xid, resumes } => {
                    if state.active.as_ref().is_some_and(|tx| &tx.xid == xid) {
                        state.active = None;
                        if *resumes {
                            state.resume();
                        }
                    }
                }
                ScopeKind::Joined { xid } | ScopeKind::Nested { xid } => {
                    if let Some(tx) = state.active.as_mut().filter(|tx| &tx.xid == xid) {
                        tx.depth = tx.depth.saturating_sub(1);
                        tx.rollback_only = true;
                    }
                }
                ScopeKind::Suspended => state.resume(),
                ScopeKind::NonTransactional => {}
            }
        });

        let ScopeKind::Begun { xid, .. } = kind else {
            warn!(scope = id, "Transactional scope dropped before exit, transaction marked rollback-only");
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(xid = %xid, "Transactional scope dropped before exit, rolling back");
                let registry = self.registry.clone();
                let xid = xid.clone();
                handle.spawn(async move {
                    registry.abandon(&xid).await;
                });
            }
            Err(_) => {
                warn!(xid = %xid, "Transactional scope dropped outside a runtime, connections left open");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalTransactionCoordinator {
    registry: ConnectionRegistry,
}

impl LocalTransactionCoordinator {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Transaction id bound to the current execution context.
    pub fn current_xid(&self) -> Option<String> {
        with_state(|state| state.active.as_ref().map(|tx| tx.xid.clone()))
    }

    pub fn is_rollback_only(&self) -> bool {
        with_state(|state| state.active.as_ref().is_some_and(|tx| tx.rollback_only))
    }

    /// Mark the bound transaction rollback-only.
    pub fn set_rollback_only(&self) -> DbResult<()> {
        with_state(|state| match state.active.as_mut() {
            Some(tx) => {
                tx.rollback_only = true;
                Ok(())
            }
            None => Err(DbError::illegal_transaction_state(
                "No transaction bound to mark rollback-only",
            )),
        })
    }

    /// Enter a transactional scope.
    ///
    /// On error the execution context is left unchanged.
    pub async fn enter(&self, options: &TxOptions) -> DbResult<TxScope> {
        let propagation = options.propagation;
        let current = self.current_xid();

        // The savepoint has to exist before the scope is recorded.
        if let (Propagation::Nested, Some(xid)) = (propagation, current.as_deref()) {
            self.registry.create_savepoint(xid).await?;
        }

        let id = SCOPE_SEQ.fetch_add(1, Ordering::Relaxed);
        let kind = with_state(|state| {
            let kind = match (propagation, state.active.as_mut()) {
                (Propagation::Never, Some(tx)) => {
                    return Err(DbError::illegal_transaction_state(format!(
                        "Propagation NEVER but transaction {} is bound",
                        tx.xid
                    )));
                }
                (Propagation::Mandatory, None) => {
                    return Err(DbError::illegal_transaction_state(
                        "Propagation MANDATORY but no transaction is bound",
                    ));
                }
                (
                    Propagation::Required | Propagation::Supports | Propagation::Mandatory,
                    Some(tx),
                ) => {
                    tx.depth += 1;
                    ScopeKind::Joined { xid: tx.xid.clone() }
                }
                (Propagation::Nested, Some(tx)) => {
                    tx.depth += 1;
                    ScopeKind::Nested { xid: tx.xid.clone() }
                }
                (Propagation::Required | Propagation::Nested, None) => {
                    let xid = generate_xid();
                    state.active = Some(ActiveTx::new(xid.clone()));
                    ScopeKind::Begun {
                        xid,
                        resumes: false,
                    }
                }
                (Propagation::RequiresNew, _) => {
                    state.suspend();
                    let xid = generate_xid();
                    state.active = Some(ActiveTx::new(xid.clone()));
                    ScopeKind::Begun { xid, resumes: true }
                }
                (Propagation::NotSupported, _) => {
                    state.suspend();
                    ScopeKind::Suspended
                }
                (Propagation::Supports | Propagation::Never, None) => ScopeKind::NonTransactional,
            };
            state.open_scopes.push(id);
            Ok(kind)
        })?;

        match &kind {
            ScopeKind::Begun { xid, resumes } => {
                info!(xid = %xid, propagation = %propagation, suspended = resumes, "Transaction started");
            }
            ScopeKind::Joined { xid } => {
                debug!(xid = %xid, propagation = %propagation, "Joined transaction");
            }
            ScopeKind::Nested { xid } => {
                debug!(xid = %xid, "Entered nested scope");
            }
            ScopeKind::Suspended => {
                debug!(suspended = ?current, "Transaction suspended");
            }
            ScopeKind::NonTransactional => {
                debug!(propagation = %propagation, "Running without transaction");
            }
        }

        Ok(TxScope {
            id,
            propagation,
            kind,
        })
    }

    /// Exit a scope returned by [`enter`](Self::enter).
    ///
    /// Scopes must exit innermost first. The scope that began the xid commits
    /// it unless `outcome` is a rollback or the xid is rollback-only, in which
    /// case everything rolls back.
    ///
    /// A scope refused before anything changed (out of order, or no longer
    /// matching the bound xid) is handed back in [`ExitError::scope`].
    pub async fn exit(&self, scope: TxScope, outcome: ScopeOutcome) -> Result<(), ExitError> {
        let checked = with_state(|state| {
            if state.open_scopes.last() != Some(&scope.id) {
                return Err(DbError::illegal_transaction_state(
                    "Transactional scopes must exit in reverse order of entry",
                ));
            }

            let finalize = match &scope.kind {
                ScopeKind::Begun { xid, resumes } => {
                    let tx = match state.active.take() {
                        Some(tx) if &tx.xid == xid => tx,
                        other => {
                            state.active = other;
                            return Err(DbError::illegal_transaction_state(format!(
                                "Transaction {} is not the bound transaction",
                                xid
                            )));
                        }
                    };
                    if *resumes {
                        state.resume();
                    }
                    let commit = outcome.commits() && !tx.rollback_only;
                    if outcome.commits() && tx.rollback_only {
                        warn!(xid = %xid, "Transaction marked rollback-only, rolling back");
                    }
                    Some(Finalize::Transaction(xid.clone(), commit))
                }
                ScopeKind::Joined { xid } | ScopeKind::Nested { xid } => {
                    let tx = state
                        .active
                        .as_mut()
                        .filter(|tx| &tx.xid == xid)
                        .ok_or_else(|| {
                            DbError::illegal_transaction_state(format!(
                                "Transaction {} is not the bound transaction",
                                xid
                            ))
                        })?;
                    tx.depth -= 1;
                    if !outcome.commits() {
                        if !tx.rollback_only {
                            debug!(xid = %xid, "Marking transaction rollback-only");
                        }
                        tx.rollback_only = true;
                    }
                    matches!(scope.kind, ScopeKind::Nested { .. })
                        .then(|| Finalize::Savepoint(xid.clone(), outcome.commits()))
                }
                ScopeKind::Suspended => {
                    state.resume();
                    None
                }
                ScopeKind::NonTransactional => None,
            };

            state.open_scopes.pop();
            Ok(finalize)
        });

        let finalize = match checked {
            Ok(finalize) => finalize,
            Err(error) => {
                return Err(ExitError {
                    error,
                    scope: Some(scope),
                });
            }
        };

        let result = match finalize {
            Some(Finalize::Transaction(xid, commit)) => self.registry.finalize(&xid, commit).await,
            Some(Finalize::Savepoint(xid, commit)) => self.registry.notify(&xid, commit).await,
            None => return Ok(()),
        };
        result.map(|_| ()).map_err(|error| ExitError { error, scope: None })
    }

    /// Run `work` inside a scope with `options`.
    ///
    /// The original error of `work` is returned. If finalizing also fails with
    /// a partial finalize, that error is returned with the original attached
    /// as its cause. If the returned future is dropped before `work`
    /// completes, the scope is unwound with rollback intent.
    pub async fn execute<F, T>(&self, options: &TxOptions, work: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let scope = self.enter(options).await?;
        let mut pending = PendingScope::new(&scope, self.registry.clone());
        let result = work.await;
        pending.disarm();
        let outcome = options.outcome(&result);

        match (result, self.exit(scope, outcome).await.map_err(DbError::from)) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(finalize)) => Err(finalize),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(finalize @ DbError::PartialFinalize { .. })) => Err(finalize.with_cause(e)),
            (Err(e), Err(finalize)) => {
                warn!(error = %finalize, "Scope exit failed after unit of work failed");
                Err(e)
            }
        }
    }

    /// Bind a transaction to the current execution context, or return the one
    /// already bound.
    pub fn begin(&self) -> String {
        with_state(|state| match &state.active {
            Some(tx) => {
                debug!(xid = %tx.xid, "Transaction already bound");
                tx.xid.clone()
            }
            None => {
                let xid = generate_xid();
                state.active = Some(ActiveTx::new(xid.clone()));
                info!(xid = %xid, "Transaction started");
                xid
            }
        })
    }

    /// Commit `xid`, or resolve its innermost savepoint level.
    ///
    /// Rolls back instead when the xid is rollback-only. The binding is
    /// cleared unless a savepoint level was resolved.
    pub async fn commit(&self, xid: &str) -> DbResult<FinalizeReport> {
        let rollback_only = with_state(|state| {
            state
                .active
                .as_ref()
                .is_some_and(|tx| tx.xid == xid && tx.rollback_only)
        });
        if rollback_only {
            warn!(xid = %xid, "Transaction marked rollback-only, rolling back");
        }
        self.finish(xid, !rollback_only).await
    }

    /// Roll back `xid`, or its innermost savepoint level.
    pub async fn rollback(&self, xid: &str) -> DbResult<FinalizeReport> {
        self.finish(xid, false).await
    }

    async fn finish(&self, xid: &str, commit: bool) -> DbResult<FinalizeReport> {
        let has_savepoint = self.registry.has_savepoint(xid).await;
        let result = self.registry.notify(xid, commit).await;
        if !has_savepoint {
            with_state(|state| {
                if state.active.as_ref().is_some_and(|tx| tx.xid == xid) {
                    state.active = None;
                }
            });
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;

    fn coordinator() -> LocalTransactionCoordinator {
        LocalTransactionCoordinator::new(ConnectionRegistry::new())
    }

    fn opts(propagation: Propagation) -> TxOptions {
        TxOptions::new(propagation)
    }

    #[test]
    fn test_xid_format() {
        let xid = generate_xid();
        assert_eq!(xid.len(), 36);
        assert!(uuid::Uuid::parse_str(&xid).is_ok());
        assert_ne!(xid, generate_xid());
    }

    #[tokio::test]
    async fn test_required_begins_then_joins() {
        context::scope(async {
            let tx = coordinator();
            let outer = tx.enter(&opts(Propagation::Required)).await.unwrap();
            let xid = outer.xid().unwrap().to_string();
            assert!(matches!(outer.kind(), ScopeKind::Begun { resumes: false, .. }));

            let inner = tx.enter(&opts(Propagation::Required)).await.unwrap();
            assert_eq!(inner.kind(), &ScopeKind::Joined { xid: xid.clone() });
            tx.exit(inner, ScopeOutcome::Commit).await.unwrap();
            assert_eq!(tx.current_xid(), Some(xid));

            tx.exit(outer, ScopeOutcome::Commit).await.unwrap();
            assert_eq!(tx.current_xid(), None);
        })
        .await;
    }

    #[tokio::test]
    async fn test_mandatory_without_transaction_leaves_state() {
        context::scope(async {
            let tx = coordinator();
            let err = tx.enter(&opts(Propagation::Mandatory)).await.unwrap_err();
            assert!(matches!(err, DbError::IllegalTransactionState { .. }));
            assert_eq!(tx.current_xid(), None);
            with_state(|state| {
                assert!(state.open_scopes.is_empty());
                assert!(state.suspended.is_empty());
            });
        })
        .await;
    }

    #[tokio::test]
    async fn test_never_with_transaction_fails() {
        context::scope(async {
            let tx = coordinator();
            let outer = tx.enter(&opts(Propagation::Required)).await.unwrap();
            let err = tx.enter(&opts(Propagation::Never)).await.unwrap_err();
            assert!(matches!(err, DbError::IllegalTransactionState { .. }));
            tx.exit(outer, ScopeOutcome::Commit).await.unwrap();

            let never = tx.enter(&opts(Propagation::Never)).await.unwrap();
            assert_eq!(never.kind(), &ScopeKind::NonTransactional);
            tx.exit(never, ScopeOutcome::Commit).await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn test_requires_new_suspends_and_resumes() {
        context::scope(async {
            let tx = coordinator();
            let outer = tx.enter(&opts(Propagation::Required)).await.unwrap();
            let outer_xid = tx.current_xid().unwrap();

            let inner = tx.enter(&opts(Propagation::RequiresNew)).await.unwrap();
            let inner_xid = tx.current_xid().unwrap();
            assert_ne!(outer_xid, inner_xid);
            assert!(!tx.registry().has_savepoint(&outer_xid).await);
            tx.exit(inner, ScopeOutcome::Commit).await.unwrap();

            assert_eq!(tx.current_xid(), Some(outer_xid));
            tx.exit(outer, ScopeOutcome::Commit).await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn test_not_supported_and_supports() {
        context::scope(async {
            let tx = coordinator();
            let supports = tx.enter(&opts(Propagation::Supports)).await.unwrap();
            assert_eq!(supports.kind(), &ScopeKind::NonTransactional);
            assert_eq!(tx.current_xid(), None);
            tx.exit(supports, ScopeOutcome::Commit).await.unwrap();

            let outer = tx.enter(&opts(Propagation::Required)).await.unwrap();
            let xid = tx.current_xid();
            let suspended = tx.enter(&opts(Propagation::NotSupported)).await.unwrap();
            assert_eq!(tx.current_xid(), None);
            tx.exit(suspended, ScopeOutcome::Commit).await.unwrap();
            assert_eq!(tx.current_xid(), xid);
            tx.exit(outer, ScopeOutcome::Commit).await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn test_joined_rollback_marks_rollback_only() {
        context::scope(async {
            let tx = coordinator();
            let outer = tx.enter(&opts(Propagation::Required)).await.unwrap();
            let inner = tx.enter(&opts(Propagation::Required)).await.unwrap();
            tx.exit(inner, ScopeOutcome::Rollback).await.unwrap();
            assert!(tx.is_rollback_only());

            let again = tx.enter(&opts(Propagation::Required)).await.unwrap();
            tx.exit(again, ScopeOutcome::Commit).await.unwrap();
            assert!(tx.is_rollback_only());
            tx.exit(outer, ScopeOutcome::Commit).await.unwrap();
            assert!(!tx.is_rollback_only());
        })
        .await;
    }

    #[tokio::test]
    async fn test_out_of_order_exit_is_rejected() {
        context::scope(async {
            let tx = coordinator();
            let outer = tx.enter(&opts(Propagation::Required)).await.unwrap();
            let inner = tx.enter(&opts(Propagation::Required)).await.unwrap();
            let xid = tx.current_xid();
            let err = tx.exit(outer, ScopeOutcome::Commit).await.unwrap_err();
            assert!(matches!(err.error, DbError::IllegalTransactionState { .. }));
            assert_eq!(tx.current_xid(), xid);

            let outer = err.scope.unwrap();
            tx.exit(inner, ScopeOutcome::Commit).await.unwrap();
            tx.exit(outer, ScopeOutcome::Commit).await.unwrap();
            assert_eq!(tx.current_xid(), None);
            with_state(|state| assert!(state.open_scopes.is_empty()));
        })
        .await;
    }

    #[tokio::test]
    async fn test_execute_returns_original_error() {
        context::scope(async {
            let tx = coordinator();
            let result: DbResult<()> = tx
                .execute(&TxOptions::default(), async {
                    Err(DbError::invalid_input("bad row"))
                })
                .await;
            assert!(matches!(result, Err(DbError::InvalidInput { .. })));
            assert_eq!(tx.current_xid(), None);
        })
        .await;
    }

    #[tokio::test]
    async fn test_manual_begin_reuses_binding() {
        context::scope(async {
            let tx = coordinator();
            let xid = tx.begin();
            assert_eq!(tx.begin(), xid);
            let report = tx.commit(&xid).await.unwrap();
            assert!(!report.savepoint);
            assert_eq!(tx.current_xid(), None);
        })
        .await;
    }
}
