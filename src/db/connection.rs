//! Physical connection and datasource abstractions.
//!
//! [`DataSource`] opens connections, [`PhysicalConnection`] is the handle the
//! transaction machinery drives: explicit `begin`, statement execution,
//! commit/rollback and savepoints. [`SqlxConnection`] implements it on top of
//! pooled `sqlx` connections.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{MySql, Postgres, Sqlite};
use tracing::debug;

/// A single physical connection.
///
/// Implementations must not auto-begin: a connection starts in autocommit mode
/// and only enters a transaction after [`begin`](PhysicalConnection::begin).
#[async_trait]
pub trait PhysicalConnection: Send {
    /// Leave autocommit mode.
    async fn begin(&mut self) -> DbResult<()>;

    /// Execute a statement, returning the affected row count.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    async fn savepoint(&mut self, name: &str) -> DbResult<()>;

    async fn release_savepoint(&mut self, name: &str) -> DbResult<()>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()>;

    /// Give the connection back to its owner. Further use fails.
    async fn close(&mut self) -> DbResult<()>;
}

/// A named, independently configured source of physical connections.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Backend type, when known.
    fn database_type(&self) -> Option<DatabaseType> {
        None
    }

    /// Open (or check out) a physical connection. Not retried on failure.
    async fn connect(&self) -> DbResult<Box<dyn PhysicalConnection>>;

    /// Release every resource held by this datasource.
    async fn close(&self) {}
}

/// Validate a generated savepoint name before splicing it into SQL.
///
/// Must start with an ASCII letter or underscore and contain only ASCII
/// alphanumerics and underscores, at most 64 characters.
pub(crate) fn validate_savepoint_name(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if !valid_start
        || name.len() > 64
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(DbError::invalid_input(format!(
            "Invalid savepoint name '{}'",
            name
        )));
    }
    Ok(())
}

enum PooledConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

/// A pooled `sqlx` connection driven through explicit transaction statements.
///
/// Closing returns the connection to its pool.
pub struct SqlxConnection {
    inner: Option<PooledConnection>,
    db_type: DatabaseType,
}

impl std::fmt::Debug for SqlxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlxConnection")
            .field("db_type", &self.db_type)
            .field("closed", &self.inner.is_none())
            .finish()
    }
}

impl SqlxConnection {
    pub fn mysql(conn: PoolConnection<MySql>) -> Self {
        Self {
            inner: Some(PooledConnection::MySql(conn)),
            db_type: DatabaseType::MySQL,
        }
    }

    pub fn postgres(conn: PoolConnection<Postgres>) -> Self {
        Self {
            inner: Some(PooledConnection::Postgres(conn)),
            db_type: DatabaseType::PostgreSQL,
        }
    }

    pub fn sqlite(conn: PoolConnection<Sqlite>) -> Self {
        Self {
            inner: Some(PooledConnection::SQLite(conn)),
            db_type: DatabaseType::SQLite,
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    fn live(&mut self) -> DbResult<&mut PooledConnection> {
        self.inner
            .as_mut()
            .ok_or_else(|| DbError::connection("Connection is closed", "Acquire a new connection"))
    }

    /// Run a transaction-control statement through the simple query path.
    async fn control(&mut self, sql: &str) -> DbResult<()> {
        use sqlx::Executor;

        debug!(db_type = %self.db_type, sql = %sql, "Transaction control");
        match self.live()? {
            PooledConnection::MySql(conn) => {
                (&mut **conn).execute(sql).await?;
            }
            PooledConnection::Postgres(conn) => {
                (&mut **conn).execute(sql).await?;
            }
            PooledConnection::SQLite(conn) => {
                (&mut **conn).execute(sql).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PhysicalConnection for SqlxConnection {
    async fn begin(&mut self) -> DbResult<()> {
        self.control("BEGIN").await
    }

    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let rows_affected = match self.live()? {
            PooledConnection::MySql(conn) => {
                bind_params!(sqlx::query(sql), params, json = sqlx::types::Json)
                    .execute(&mut **conn)
                    .await?
                    .rows_affected()
            }
            PooledConnection::Postgres(conn) => {
                bind_params!(sqlx::query(sql), params, json = sqlx::types::Json)
                    .execute(&mut **conn)
                    .await?
                    .rows_affected()
            }
            // SQLite has no native JSON type, store as text
            PooledConnection::SQLite(conn) => {
                bind_params!(sqlx::query(sql), params, json = serde_json::Value::to_string)
                    .execute(&mut **conn)
                    .await?
                    .rows_affected()
            }
        };
        Ok(rows_affected)
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.control("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.control("ROLLBACK").await
    }

    async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        self.control(&format!("SAVEPOINT {}", name)).await
    }

    async fn release_savepoint(&mut self, name: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        self.control(&format!("RELEASE SAVEPOINT {}", name)).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        validate_savepoint_name(name)?;
        self.control(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .await
    }

    async fn close(&mut self) -> DbResult<()> {
        // Dropping the pooled connection hands it back to the pool.
        self.inner.take();
        Ok(())
    }
}
