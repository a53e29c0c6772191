//! Connection proxies handed to application code.
//!
//! A managed proxy belongs to a logical transaction: the physical connection
//! has been put in transaction mode and the application-side `commit`,
//! `rollback` and `close` calls are swallowed. Only the
//! [`ConnectionRegistry`](crate::db::ConnectionRegistry) resolves it, through
//! [`ConnectionProxy::notify`]. An unmanaged proxy runs in autocommit mode and
//! closes for real.

use crate::db::connection::PhysicalConnection;
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_savepoint_name() -> String {
    format!("dds_sp_{}", SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// How a [`ConnectionProxy::notify`] call was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The top savepoint was released or rolled back to; the connection stays open.
    Savepoint,
    /// The physical transaction was committed or rolled back and the connection closed.
    Finalized,
}

struct ProxyState {
    connection: Option<Box<dyn PhysicalConnection>>,
    savepoints: Vec<String>,
}

impl ProxyState {
    fn live(&mut self) -> DbResult<&mut Box<dyn PhysicalConnection>> {
        self.connection
            .as_mut()
            .ok_or_else(|| DbError::connection("Connection is closed", "Acquire a new connection"))
    }
}

pub struct ConnectionProxy {
    key: String,
    xid: Option<String>,
    closed: AtomicBool,
    state: Mutex<ProxyState>,
}

impl std::fmt::Debug for ConnectionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProxy")
            .field("key", &self.key)
            .field("xid", &self.xid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionProxy {
    /// Wrap a connection already in transaction mode for `xid`.
    pub(crate) fn managed(
        key: impl Into<String>,
        xid: impl Into<String>,
        connection: Box<dyn PhysicalConnection>,
    ) -> Self {
        Self::build(key.into(), Some(xid.into()), connection)
    }

    /// Wrap an autocommit connection outside any logical transaction.
    pub fn unmanaged(key: impl Into<String>, connection: Box<dyn PhysicalConnection>) -> Self {
        Self::build(key.into(), None, connection)
    }

    fn build(key: String, xid: Option<String>, connection: Box<dyn PhysicalConnection>) -> Self {
        Self {
            key,
            xid,
            closed: AtomicBool::new(false),
            state: Mutex::new(ProxyState {
                connection: Some(connection),
                savepoints: Vec::new(),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn xid(&self) -> Option<&str> {
        self.xid.as_deref()
    }

    pub fn is_managed(&self) -> bool {
        self.xid.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn savepoint_depth(&self) -> usize {
        self.state.lock().await.savepoints.len()
    }

    /// Execute a statement on the underlying connection.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let rows = state.live()?.execute(sql, params).await?;
        debug!(key = %self.key, xid = ?self.xid, rows_affected = rows, "Executed statement");
        Ok(rows)
    }

    /// Deferred while managed; autocommit makes it a no-op otherwise.
    pub async fn commit(&self) -> DbResult<()> {
        debug!(key = %self.key, xid = ?self.xid, "Ignoring application commit");
        Ok(())
    }

    /// Deferred while managed; autocommit makes it a no-op otherwise.
    pub async fn rollback(&self) -> DbResult<()> {
        debug!(key = %self.key, xid = ?self.xid, "Ignoring application rollback");
        Ok(())
    }

    /// Close an unmanaged connection. Managed connections are closed at finalize.
    pub async fn close(&self) -> DbResult<()> {
        if self.is_managed() {
            debug!(key = %self.key, xid = ?self.xid, "Deferring close until finalize");
            return Ok(());
        }
        let mut state = self.state.lock().await;
        self.close_locked(&mut state).await
    }

    async fn close_locked(&self, state: &mut ProxyState) -> DbResult<()> {
        let Some(mut connection) = state.connection.take() else {
            return Ok(());
        };
        self.closed.store(true, Ordering::Release);
        state.savepoints.clear();
        connection.close().await
    }

    /// Leave autocommit mode on the physical connection.
    pub(crate) async fn begin(&self) -> DbResult<()> {
        let mut state = self.state.lock().await;
        state.live()?.begin().await
    }

    /// Open a new savepoint on top of this connection's stack.
    pub(crate) async fn push_savepoint(&self) -> DbResult<String> {
        let mut state = self.state.lock().await;
        let name = next_savepoint_name();
        state.live()?.savepoint(&name).await?;
        state.savepoints.push(name.clone());
        debug!(key = %self.key, xid = ?self.xid, savepoint = %name, "Savepoint created");
        Ok(name)
    }

    /// Resolve one level of this connection.
    ///
    /// With a savepoint on the stack, pop it and release it (`commit`) or roll
    /// back to it. Otherwise commit or roll back the physical transaction and
    /// close the connection. The connection is closed even when the commit
    /// fails, after a best-effort rollback.
    pub(crate) async fn notify(&self, commit: bool) -> DbResult<Resolution> {
        let mut state = self.state.lock().await;

        if let Some(name) = state.savepoints.pop() {
            let connection = state.live()?;
            if commit {
                connection.release_savepoint(&name).await?;
            } else {
                connection.rollback_to_savepoint(&name).await?;
            }
            debug!(key = %self.key, xid = ?self.xid, savepoint = %name, commit, "Savepoint resolved");
            return Ok(Resolution::Savepoint);
        }

        self.finalize_locked(&mut state, commit).await?;
        Ok(Resolution::Finalized)
    }

    /// Commit or roll back the physical transaction and close, whatever
    /// savepoints are still open.
    pub(crate) async fn finalize(&self, commit: bool) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if !state.savepoints.is_empty() {
            debug!(key = %self.key, xid = ?self.xid, open = state.savepoints.len(), "Finalizing over open savepoints");
            state.savepoints.clear();
        }
        self.finalize_locked(&mut state, commit).await
    }

    async fn finalize_locked(&self, state: &mut ProxyState, commit: bool) -> DbResult<()> {
        let connection = state.live()?;
        let outcome = if commit {
            let result = connection.commit().await;
            if result.is_err() {
                if let Err(e) = connection.rollback().await {
                    warn!(key = %self.key, xid = ?self.xid, error = %e, "Rollback after failed commit also failed");
                }
            }
            result
        } else {
            connection.rollback().await
        };

        let closed = self.close_locked(state).await;
        outcome?;
        closed?;
        debug!(key = %self.key, xid = ?self.xid, commit, "Connection finalized");
        Ok(())
    }

    /// Roll back and close, ignoring failures. Used for connections that lost
    /// an acquisition race and for abandoned transactions.
    pub(crate) async fn discard(&self) {
        let mut state = self.state.lock().await;
        if let Ok(connection) = state.live() {
            let _ = connection.rollback().await;
        }
        let _ = self.close_locked(&mut state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Clone, Default)]
    struct Log(Arc<StdMutex<Vec<String>>>);

    impl Log {
        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Recording {
        log: Log,
        fail_commit: bool,
    }

    #[async_trait]
    impl PhysicalConnection for Recording {
        async fn begin(&mut self) -> DbResult<()> {
            self.log.0.lock().unwrap().push("begin".into());
            Ok(())
        }
        async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<u64> {
            self.log.0.lock().unwrap().push(format!("exec {sql}"));
            Ok(1)
        }
        async fn commit(&mut self) -> DbResult<()> {
            self.log.0.lock().unwrap().push("commit".into());
            if self.fail_commit {
                return Err(DbError::internal("commit refused"));
            }
            Ok(())
        }
        async fn rollback(&mut self) -> DbResult<()> {
            self.log.0.lock().unwrap().push("rollback".into());
            Ok(())
        }
        async fn savepoint(&mut self, _name: &str) -> DbResult<()> {
            self.log.0.lock().unwrap().push("savepoint".into());
            Ok(())
        }
        async fn release_savepoint(&mut self, _name: &str) -> DbResult<()> {
            self.log.0.lock().unwrap().push("release".into());
            Ok(())
        }
        async fn rollback_to_savepoint(&mut self, _name: &str) -> DbResult<()> {
            self.log.0.lock().unwrap().push("rollback_to".into());
            Ok(())
        }
        async fn close(&mut self) -> DbResult<()> {
            self.log.0.lock().unwrap().push("close".into());
            Ok(())
        }
    }

    fn recording(log: &Log, fail_commit: bool) -> Box<dyn PhysicalConnection> {
        Box::new(Recording {
            log: log.clone(),
            fail_commit,
        })
    }

    #[tokio::test]
    async fn test_managed_defers_application_calls() {
        let log = Log::default();
        let proxy = ConnectionProxy::managed("a", "xid-1", recording(&log, false));
        proxy.execute("UPDATE t", &[]).await.unwrap();
        proxy.commit().await.unwrap();
        proxy.rollback().await.unwrap();
        proxy.close().await.unwrap();
        assert!(!proxy.is_closed());
        assert_eq!(log.entries(), vec!["exec UPDATE t"]);
    }

    #[tokio::test]
    async fn test_unmanaged_close_is_real() {
        let log = Log::default();
        let proxy = ConnectionProxy::unmanaged("a", recording(&log, false));
        assert!(!proxy.is_managed());
        proxy.close().await.unwrap();
        assert!(proxy.is_closed());
        assert!(proxy.execute("SELECT 1", &[]).await.is_err());
        assert_eq!(log.entries(), vec!["close"]);
    }

    #[tokio::test]
    async fn test_notify_pops_savepoints_before_finalizing() {
        let log = Log::default();
        let proxy = ConnectionProxy::managed("a", "xid-1", recording(&log, false));
        let first = proxy.push_savepoint().await.unwrap();
        let second = proxy.push_savepoint().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(proxy.savepoint_depth().await, 2);

        assert_eq!(proxy.notify(false).await.unwrap(), Resolution::Savepoint);
        assert_eq!(proxy.notify(true).await.unwrap(), Resolution::Savepoint);
        assert_eq!(proxy.notify(true).await.unwrap(), Resolution::Finalized);
        assert!(proxy.is_closed());
        assert_eq!(
            log.entries(),
            vec!["savepoint", "savepoint", "rollback_to", "release", "commit", "close"]
        );
    }

    #[tokio::test]
    async fn test_failed_commit_still_closes() {
        let log = Log::default();
        let proxy = ConnectionProxy::managed("a", "xid-1", recording(&log, true));
        assert!(proxy.notify(true).await.is_err());
        assert!(proxy.is_closed());
        assert_eq!(log.entries(), vec!["commit", "rollback", "close"]);
    }
}
