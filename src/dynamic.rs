//! The logical datasource handle.
//!
//! [`DynamicDataSource`] ties the pieces together: selectors are resolved to
//! keys and pushed for the duration of a unit of work, connections are opened
//! against the current key, and connections opened while a transaction is
//! bound are registered under it.
//!
//! The scoped helpers run inside the enclosing task context. Outside any task
//! scope they carry the calling thread's context, so a key pushed or a
//! transaction bound on the thread applies to the work.

use crate::config::{DataSourceConfig, RoutingOptions};
use crate::context;
use crate::db::{
    ConnectionProxy, ConnectionRegistry, DataSourceHandle, DbPool, RoutingTable,
};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, QueryParam};
use crate::resolver::{InvocationContext, KeyResolver};
use crate::tx::{LocalTransactionCoordinator, TxOptions};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct DynamicDataSource {
    routing: Arc<RoutingTable>,
    coordinator: LocalTransactionCoordinator,
    resolver: Arc<KeyResolver>,
}

impl DynamicDataSource {
    pub fn new(options: RoutingOptions) -> Self {
        Self::with_resolver(RoutingTable::new(options), KeyResolver::default())
    }

    pub fn with_resolver(routing: RoutingTable, resolver: KeyResolver) -> Self {
        Self {
            routing: Arc::new(routing),
            coordinator: LocalTransactionCoordinator::new(ConnectionRegistry::new()),
            resolver: Arc::new(resolver),
        }
    }

    /// Create pools for every configured datasource and register them.
    pub async fn from_configs(
        configs: Vec<DataSourceConfig>,
        options: RoutingOptions,
    ) -> DbResult<Self> {
        let dynamic = Self::new(options);
        info!(count = configs.len(), "Registering configured datasources");
        for config in configs {
            let config = ConnectionConfig::try_from(config)
                .map_err(|e| DbError::invalid_input(e.to_string()))?;
            let pool = DbPool::create(&config).await?;
            dynamic.register(config.key.clone(), Arc::new(pool)).await?;
        }
        Ok(dynamic)
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.coordinator.registry()
    }

    pub fn coordinator(&self) -> &LocalTransactionCoordinator {
        &self.coordinator
    }

    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    pub async fn register(
        &self,
        key: impl Into<String>,
        data_source: DataSourceHandle,
    ) -> DbResult<Option<DataSourceHandle>> {
        self.routing.register(key, data_source).await
    }

    pub async fn unregister(&self, key: &str) -> Option<DataSourceHandle> {
        self.routing.unregister(key).await
    }

    /// Key selected in the current execution context, or the primary.
    pub fn current_key(&self) -> String {
        self.routing.current_key()
    }

    /// Connection for the current key.
    ///
    /// While a transaction is bound the connection is registered under it and
    /// reused for the same key; otherwise it is an autocommit connection the
    /// caller closes.
    pub async fn get_connection(&self) -> DbResult<Arc<ConnectionProxy>> {
        let key = self.routing.current_key();
        match self.coordinator.current_xid() {
            Some(xid) => {
                self.registry()
                    .acquire(&xid, &key, || self.routing.open(&key))
                    .await
            }
            None => {
                let connection = self.routing.open(&key).await?;
                debug!(key = %key, "Opened autocommit connection");
                Ok(Arc::new(ConnectionProxy::unmanaged(key, connection)))
            }
        }
    }

    /// Execute one statement on a connection for the current key.
    ///
    /// A statement error takes precedence over a failure to close.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let connection = self.get_connection().await?;
        let result = connection.execute(sql, params).await;
        let closed = connection.close().await;
        let rows = result?;
        closed?;
        Ok(rows)
    }

    /// Resolve `selector` and run `work` with the resulting key selected.
    pub async fn with_selector<F, T>(
        &self,
        selector: &str,
        ctx: &InvocationContext,
        work: F,
    ) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let key = self.resolver.resolve(selector, ctx)?;
        self.with_key(key, work).await
    }

    /// Run `work` with `key` selected. The key is popped on every exit path.
    pub async fn with_key<F>(&self, key: impl Into<String>, work: F) -> F::Output
    where
        F: Future,
    {
        let key = key.into();
        context::scoped(async move {
            let _selection = context::enter(key);
            work.await
        })
        .await
    }

    /// Run `work` inside a transactional scope.
    pub async fn transactional<F, T>(&self, options: &TxOptions, work: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        context::scoped(self.coordinator.execute(options, work)).await
    }

    /// Close every registered datasource.
    pub async fn close(&self) {
        self.routing.close_all().await;
    }
}
