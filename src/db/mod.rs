//! Database layer.
//!
//! This module provides:
//! - Physical connection and datasource traits, with `sqlx` implementations
//! - Connection pools per backend
//! - The routing table mapping keys to datasources
//! - Connection proxies and the per-transaction connection registry
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod connection;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod routing;

pub use connection::{DataSource, PhysicalConnection, SqlxConnection};
pub use pool::DbPool;
pub use proxy::{ConnectionProxy, Resolution};
pub use registry::{ConnectionRegistry, FinalizeReport, TransactionMetadata};
pub use routing::{
    DataSourceHandle, LoadBalanceStrategy, RandomStrategy, RoundRobinStrategy, RoutingTable,
};
