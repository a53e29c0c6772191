//! Backend dispatch macros.
//!
//! The three `sqlx` backends expose the same operations on distinct types.
//! These macros expand the per-backend arms at compile time so call sites stay
//! linear.

/// Generate match arms over [`DbPool`](crate::db::DbPool) variants.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => p.close().await,
///     Postgres(p) => p.close().await,
///     SQLite(p) => p.close().await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Bind every [`QueryParam`](crate::models::QueryParam) onto a `sqlx` query.
///
/// `json` converts a `&serde_json::Value` into something the backend can
/// encode: `sqlx::types::Json` where JSON is native, text otherwise.
#[macro_export]
macro_rules! bind_params {
    ($query:expr, $params:expr, json = $json:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                $crate::models::QueryParam::Null => query.bind(None::<String>),
                $crate::models::QueryParam::Bool(v) => query.bind(*v),
                $crate::models::QueryParam::Int(v) => query.bind(*v),
                $crate::models::QueryParam::Float(v) => query.bind(*v),
                $crate::models::QueryParam::String(v) => query.bind(v.as_str()),
                $crate::models::QueryParam::Json(v) => query.bind($json(v)),
            };
        }
        query
    }};
}

pub use bind_params;
pub use impl_db_dispatch;
