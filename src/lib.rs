//! Dynamic datasource routing with cross-connection local transactions.
//!
//! Application code works against one logical [`DynamicDataSource`]. Each unit
//! of work selects a physical datasource by key, either literally or through a
//! dynamic selector resolved from the invocation (request header, session
//! attribute or argument expression). Transactional units of work bind a
//! logical transaction id; every connection opened under it, against any
//! datasource, is committed or rolled back together, with savepoints for
//! nested scopes.

pub mod config;
pub mod context;
pub mod db;
pub mod dynamic;
pub mod error;
pub mod models;
pub mod resolver;
pub mod tx;

pub use config::Config;
pub use dynamic::DynamicDataSource;
pub use error::{DbError, DbResult, ErrorKind};
pub use resolver::{InvocationContext, KeyResolver};
pub use tx::{LocalTransactionCoordinator, Propagation, TxOptions};
