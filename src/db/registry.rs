//! Connection registry for logical transactions.
//!
//! Tracks, per transaction id (xid), the ordered set of physical connections
//! opened under it, and drives them together at finalize time. Each
//! connection holds the same number of savepoints as the xid has open nesting
//! levels, so one [`notify`](ConnectionRegistry::notify) resolves exactly one
//! level on every connection.

use crate::db::connection::PhysicalConnection;
use crate::db::proxy::{ConnectionProxy, Resolution};
use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct XidEntry {
    /// In first-acquisition order.
    connections: Vec<Arc<ConnectionProxy>>,
    savepoint_level: usize,
    created_at: Instant,
}

impl XidEntry {
    fn new() -> Self {
        Self {
            connections: Vec::new(),
            savepoint_level: 0,
            created_at: Instant::now(),
        }
    }

    fn find(&self, key: &str) -> Option<Arc<ConnectionProxy>> {
        self.connections
            .iter()
            .find(|proxy| proxy.key() == key && !proxy.is_closed())
            .cloned()
    }
}

/// Metadata about a logical transaction (for listing without touching connections).
#[derive(Debug, Clone)]
pub struct TransactionMetadata {
    pub xid: String,
    /// Datasource keys in acquisition order
    pub keys: Vec<String>,
    pub savepoint_level: usize,
    /// When the first connection or savepoint was registered
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
}

/// Outcome of a fully successful [`ConnectionRegistry::notify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    pub xid: String,
    /// Connections resolved
    pub succeeded: usize,
    /// Whether a savepoint level was resolved rather than the transaction itself
    pub savepoint: bool,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    entries: Arc<RwLock<HashMap<String, XidEntry>>>,
    /// System start time for converting Instant to DateTime
    system_start_instant: Instant,
    system_start_datetime: DateTime<Utc>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("started_at", &self.system_start_datetime)
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            system_start_instant: Instant::now(),
            system_start_datetime: Utc::now(),
        }
    }

    /// Return the connection registered for `(xid, key)`, opening one with
    /// `opener` if there is none yet.
    ///
    /// A new connection is put in transaction mode and receives one savepoint
    /// per open nesting level of `xid`. `opener` runs without any registry lock
    /// held; its error is returned unchanged.
    pub async fn acquire<F, Fut>(
        &self,
        xid: &str,
        key: &str,
        opener: F,
    ) -> DbResult<Arc<ConnectionProxy>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<Box<dyn PhysicalConnection>>>,
    {
        let level = {
            let entries = self.entries.read().await;
            match entries.get(xid) {
                Some(entry) => {
                    if let Some(existing) = entry.find(key) {
                        debug!(xid = %xid, key = %key, "Reusing registered connection");
                        return Ok(existing);
                    }
                    entry.savepoint_level
                }
                None => 0,
            }
        };

        let proxy = Arc::new(ConnectionProxy::managed(key, xid, opener().await?));
        if let Err(e) = proxy.begin().await {
            proxy.discard().await;
            return Err(DbError::connection_acquisition(
                key,
                format!("failed to begin transaction: {}", e),
            ));
        }
        for _ in 0..level {
            if let Err(e) = proxy.push_savepoint().await {
                proxy.discard().await;
                return Err(e);
            }
        }

        // Re-check: another acquisition for the same pair may have won the race.
        let winner = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(xid.to_string()).or_insert_with(XidEntry::new);
            match entry.find(key) {
                Some(existing) => Some(existing),
                None => {
                    entry.connections.push(Arc::clone(&proxy));
                    None
                }
            }
        };

        if let Some(existing) = winner {
            proxy.discard().await;
            return Ok(existing);
        }

        info!(xid = %xid, key = %key, savepoints = level, "Connection registered");
        Ok(proxy)
    }

    /// Open one nesting level on `xid`: every registered connection gets a new
    /// savepoint, and later acquisitions start at the new depth.
    ///
    /// Returns the new level. If a savepoint cannot be created the level is
    /// undone on the connections that already got one.
    pub async fn create_savepoint(&self, xid: &str) -> DbResult<usize> {
        let (level, proxies) = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(xid.to_string()).or_insert_with(XidEntry::new);
            entry.savepoint_level += 1;
            (entry.savepoint_level, entry.connections.clone())
        };

        let mut created = Vec::with_capacity(proxies.len());
        for proxy in proxies {
            match proxy.push_savepoint().await {
                Ok(_) => created.push(proxy),
                Err(e) => {
                    warn!(xid = %xid, key = %proxy.key(), error = %e, "Savepoint creation failed");
                    for done in created {
                        let _ = done.notify(true).await;
                    }
                    self.drop_level(xid).await;
                    return Err(e);
                }
            }
        }

        debug!(xid = %xid, level, "Savepoint level opened");
        Ok(level)
    }

    async fn drop_level(&self, xid: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(xid) {
            entry.savepoint_level = entry.savepoint_level.saturating_sub(1);
            if entry.savepoint_level == 0 && entry.connections.is_empty() {
                entries.remove(xid);
            }
        }
    }

    /// Whether `xid` currently has an open nesting level.
    pub async fn has_savepoint(&self, xid: &str) -> bool {
        self.savepoint_level(xid).await > 0
    }

    pub async fn savepoint_level(&self, xid: &str) -> usize {
        let entries = self.entries.read().await;
        entries.get(xid).map_or(0, |entry| entry.savepoint_level)
    }

    /// Resolve the innermost level of `xid` on every registered connection, in
    /// acquisition order.
    ///
    /// With a savepoint level open, each connection releases (`commit`) or
    /// rolls back to its top savepoint. Otherwise each connection commits or
    /// rolls back for real and is closed and removed. Every connection is
    /// attempted; if any failed the first failure is returned as
    /// [`DbError::PartialFinalize`] with the counts.
    pub async fn notify(&self, xid: &str, commit: bool) -> DbResult<FinalizeReport> {
        self.resolve(xid, commit, false).await
    }

    /// Commit or roll back `xid` as a whole. Every connection is finalized
    /// for real and closed, whatever nesting levels are still open.
    pub async fn finalize(&self, xid: &str, commit: bool) -> DbResult<FinalizeReport> {
        self.resolve(xid, commit, true).await
    }

    async fn resolve(&self, xid: &str, commit: bool, whole: bool) -> DbResult<FinalizeReport> {
        let (proxies, savepoint) = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(xid) {
                Some(entry) => {
                    if whole && entry.savepoint_level > 0 {
                        warn!(xid = %xid, levels = entry.savepoint_level, "Finalizing with nesting levels still open");
                        entry.savepoint_level = 0;
                    }
                    let savepoint = entry.savepoint_level > 0;
                    if savepoint {
                        entry.savepoint_level -= 1;
                    }
                    (entry.connections.clone(), savepoint)
                }
                None => {
                    debug!(xid = %xid, "No connections registered");
                    return Ok(FinalizeReport {
                        xid: xid.to_string(),
                        succeeded: 0,
                        savepoint: false,
                    });
                }
            }
        };

        let mut succeeded = 0;
        let mut failures = Vec::new();
        for proxy in &proxies {
            let resolved = if whole {
                proxy.finalize(commit).await.map(|_| Resolution::Finalized)
            } else {
                proxy.notify(commit).await
            };
            match resolved {
                Ok(resolution) => {
                    if savepoint && resolution == Resolution::Finalized {
                        warn!(xid = %xid, key = %proxy.key(), "Connection had no savepoint for the open level");
                    }
                    succeeded += 1;
                }
                Err(e) => {
                    warn!(xid = %xid, key = %proxy.key(), commit, error = %e, "Failed to finalize connection");
                    failures.push(e);
                }
            }
        }

        {
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(xid) {
                entry.connections.retain(|proxy| !proxy.is_closed());
                if entry.connections.is_empty() && entry.savepoint_level == 0 {
                    entries.remove(xid);
                }
            }
        }

        let failed = failures.len();
        if let Some(first) = failures.into_iter().next() {
            warn!(xid = %xid, succeeded, failed, commit, "Partial finalize");
            return Err(DbError::partial_finalize(xid, succeeded, failed, first));
        }

        if savepoint {
            debug!(xid = %xid, succeeded, commit, "Savepoint level resolved");
        } else {
            info!(xid = %xid, succeeded, commit, "Transaction finalized");
        }
        Ok(FinalizeReport {
            xid: xid.to_string(),
            succeeded,
            savepoint,
        })
    }

    /// Forget `xid` without finalizing it. Every connection is rolled back and
    /// closed, ignoring failures. Returns the number of connections dropped.
    pub async fn abandon(&self, xid: &str) -> usize {
        let entry = self.entries.write().await.remove(xid);
        let Some(entry) = entry else {
            return 0;
        };
        for proxy in &entry.connections {
            proxy.discard().await;
        }
        warn!(xid = %xid, connections = entry.connections.len(), "Transaction abandoned");
        entry.connections.len()
    }

    /// Keys with a live connection under `xid`, in acquisition order.
    pub async fn keys(&self, xid: &str) -> Vec<String> {
        let entries = self.entries.read().await;
        entries.get(xid).map_or_else(Vec::new, |entry| {
            entry
                .connections
                .iter()
                .map(|proxy| proxy.key().to_string())
                .collect()
        })
    }

    /// List all logical transactions with their metadata.
    pub async fn list_all(&self) -> Vec<TransactionMetadata> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(xid, entry)| {
                let offset_from_start = entry.created_at.duration_since(self.system_start_instant);
                TransactionMetadata {
                    xid: xid.clone(),
                    keys: entry
                        .connections
                        .iter()
                        .map(|proxy| proxy.key().to_string())
                        .collect(),
                    savepoint_level: entry.savepoint_level,
                    started_at: self.system_start_datetime + offset_from_start,
                    duration_secs: entry.created_at.elapsed().as_secs(),
                }
            })
            .collect()
    }

    /// Number of logical transactions with registered state.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
