//! Routing table: datasource key to physical datasource.
//!
//! Keys are looked up exactly first, then as group names. A key of the form
//! `group_member` is also a member of the group `group`, and a group lookup
//! picks a member through the configured [`LoadBalanceStrategy`].

use crate::config::{RoutingOptions, StrategyKind};
use crate::context;
use crate::db::connection::{DataSource, PhysicalConnection};
use crate::error::{DbError, DbResult};
use crate::resolver::DYNAMIC_PREFIX;
use futures_util::future::join_all;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Shared handle to a registered datasource.
pub type DataSourceHandle = Arc<dyn DataSource>;

/// Picks one member of a datasource group.
pub trait LoadBalanceStrategy: Send + Sync + std::fmt::Debug {
    /// Index into `members`, which is never empty.
    fn select(&self, group: &str, members: &[String]) -> usize;
}

#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    next: AtomicUsize,
}

impl LoadBalanceStrategy for RoundRobinStrategy {
    fn select(&self, _group: &str, members: &[String]) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % members.len()
    }
}

#[derive(Debug, Default)]
pub struct RandomStrategy;

impl LoadBalanceStrategy for RandomStrategy {
    fn select(&self, _group: &str, members: &[String]) -> usize {
        rand::thread_rng().gen_range(0..members.len())
    }
}

impl From<StrategyKind> for Arc<dyn LoadBalanceStrategy> {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::RoundRobin => Arc::new(RoundRobinStrategy::default()),
            StrategyKind::Random => Arc::new(RandomStrategy),
        }
    }
}

/// Group a key belongs to, if any: the part before the first `_`.
fn group_of(key: &str) -> Option<&str> {
    match key.split_once('_') {
        Some((group, _)) if !group.is_empty() => Some(group),
        _ => None,
    }
}

#[derive(Default)]
struct RoutingState {
    sources: HashMap<String, DataSourceHandle>,
    /// Member keys per group, in registration order
    groups: BTreeMap<String, Vec<String>>,
}

impl RoutingState {
    fn lookup(&self, key: &str, strategy: &dyn LoadBalanceStrategy) -> Option<(String, DataSourceHandle)> {
        if let Some(handle) = self.sources.get(key) {
            return Some((key.to_string(), Arc::clone(handle)));
        }
        let members = self.groups.get(key).filter(|m| !m.is_empty())?;
        let member = &members[strategy.select(key, members) % members.len()];
        self.sources
            .get(member)
            .map(|handle| (member.clone(), Arc::clone(handle)))
    }
}

pub struct RoutingTable {
    options: RoutingOptions,
    strategy: Arc<dyn LoadBalanceStrategy>,
    state: RwLock<RoutingState>,
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("options", &self.options)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl RoutingTable {
    pub fn new(options: RoutingOptions) -> Self {
        let strategy = options.strategy.into();
        Self::with_strategy(options, strategy)
    }

    /// Create a routing table with a custom group member strategy.
    pub fn with_strategy(options: RoutingOptions, strategy: Arc<dyn LoadBalanceStrategy>) -> Self {
        Self {
            options,
            strategy,
            state: RwLock::new(RoutingState::default()),
        }
    }

    pub fn options(&self) -> &RoutingOptions {
        &self.options
    }

    pub fn primary(&self) -> &str {
        &self.options.primary
    }

    /// Register `data_source` under `key`, returning the handle it replaces.
    pub async fn register(
        &self,
        key: impl Into<String>,
        data_source: DataSourceHandle,
    ) -> DbResult<Option<DataSourceHandle>> {
        let key = key.into();
        if key.is_empty() || key.starts_with(DYNAMIC_PREFIX) {
            return Err(DbError::invalid_input(format!(
                "Datasource key '{}' must be non-empty and must not start with '{}'",
                key, DYNAMIC_PREFIX
            )));
        }

        let db_type = data_source.database_type();
        let mut state = self.state.write().await;
        let previous = state.sources.insert(key.clone(), data_source);
        if let Some(group) = group_of(&key) {
            let members = state.groups.entry(group.to_string()).or_default();
            if !members.contains(&key) {
                members.push(key.clone());
            }
        }
        drop(state);

        if previous.is_some() {
            info!(key = %key, db_type = ?db_type, "Datasource replaced");
        } else {
            info!(key = %key, db_type = ?db_type, "Datasource registered");
        }
        Ok(previous)
    }

    /// Remove `key` from the table. The handle is returned unclosed so that
    /// connections already open against it stay usable.
    pub async fn unregister(&self, key: &str) -> Option<DataSourceHandle> {
        let mut state = self.state.write().await;
        let removed = state.sources.remove(key)?;
        if let Some(group) = group_of(key) {
            if let Some(members) = state.groups.get_mut(group) {
                members.retain(|member| member != key);
                if members.is_empty() {
                    state.groups.remove(group);
                }
            }
        }
        drop(state);

        info!(key = %key, "Datasource unregistered");
        Some(removed)
    }

    /// Key currently selected in this execution context, or the primary.
    pub fn current_key(&self) -> String {
        context::peek_or(&self.options.primary)
    }

    /// Datasource for the current key.
    pub async fn current_data_source(&self) -> DbResult<DataSourceHandle> {
        let key = self.current_key();
        self.resolve(&key).await.map(|(_, handle)| handle)
    }

    /// Look up `key`, returning the physical key chosen and its handle.
    ///
    /// Unknown keys fall back to the primary unless the table is strict.
    pub async fn resolve(&self, key: &str) -> DbResult<(String, DataSourceHandle)> {
        let state = self.state.read().await;
        if let Some(found) = state.lookup(key, self.strategy.as_ref()) {
            debug!(key = %key, physical = %found.0, "Datasource resolved");
            return Ok(found);
        }

        if self.options.strict {
            return Err(DbError::unknown_data_source(
                key,
                "Register the datasource, or disable strict routing to fall back to the primary",
            ));
        }

        match state.lookup(&self.options.primary, self.strategy.as_ref()) {
            Some(found) => {
                warn!(key = %key, primary = %self.options.primary, "Unknown datasource, using primary");
                Ok(found)
            }
            None => Err(DbError::unknown_data_source(
                key,
                format!(
                    "No datasource or group named '{}' and primary '{}' is not registered",
                    key, self.options.primary
                ),
            )),
        }
    }

    /// Open a physical connection for `key`.
    ///
    /// Routing errors are returned as is; a failed connect becomes
    /// [`DbError::ConnectionAcquisition`]. Not retried.
    pub async fn open(&self, key: &str) -> DbResult<Box<dyn PhysicalConnection>> {
        let (physical, handle) = self.resolve(key).await?;
        handle
            .connect()
            .await
            .map_err(|e| DbError::connection_acquisition(physical, e.to_string()))
    }

    pub async fn contains(&self, key: &str) -> bool {
        let state = self.state.read().await;
        state.sources.contains_key(key) || state.groups.contains_key(key)
    }

    /// Registered keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut keys: Vec<String> = state.sources.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn groups(&self) -> BTreeMap<String, Vec<String>> {
        self.state.read().await.groups.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.sources.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove and close every registered datasource.
    pub async fn close_all(&self) {
        let drained: Vec<(String, DataSourceHandle)> = {
            let mut state = self.state.write().await;
            state.groups.clear();
            state.sources.drain().collect()
        };
        info!(count = drained.len(), "Closing all datasources");
        join_all(drained.iter().map(|(_, handle)| handle.close())).await;
    }
}
