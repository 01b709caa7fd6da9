//! # shardline-rdbc
//!
//! Relational database connectivity for the shardline data-movement engine.
//!
//! This crate provides the connection layer inventory scans run on:
//!
//! ## Features
//!
//! - **Unified Value Model**: one `Value` type for scanned rows and decoded binlog row images
//! - **Row Streaming**: pull-based `RowStream` over an open statement
//! - **Forceful Cancellation**: `QueryCanceller` handles that interrupt a running statement
//! - **SQL Dialect Abstraction**: ordered, parameterized SELECTs rendered with sea-query
//! - **Metadata Discovery**: primary and unique key lookup for MySQL tables
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shardline_rdbc::prelude::*;
//!
//! let conn = MySqlConnection::connect(&ConnectionConfig::new("mysql://root@localhost/ds_0")).await?;
//! let mut rows = conn
//!     .query_stream("SELECT * FROM t_order WHERE order_id > ?", &[Value::Int64(100)])
//!     .await?;
//! while let Some(row) = rows.next().await? {
//!     println!("{:?}", row.get_by_name("order_id"));
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `mysql` - MySQL/MariaDB support via mysql_async (default)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod dialect;
pub mod error;
pub mod security;
pub mod types;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result};

    pub use crate::types::{ColumnMetadata, Row, TableMetadata, Value};

    pub use crate::connection::{
        Connection, ConnectionConfig, DatabaseType, QueryCanceller, RowStream, VecRowStream,
    };

    pub use crate::dialect::{
        dialect_for, Comparison, MariaDbDialect, MySqlDialect, PostgresDialect, Predicate,
        SelectSpec, SqlDialect,
    };

    #[cfg(feature = "mysql")]
    pub use crate::mysql::{MySqlConnection, MySqlQueryCanceller};
}

pub use error::{Error, Result};
pub use types::Value;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _value = Value::Int32(42);
        let _config = ConnectionConfig::new("mysql://localhost/ds_0");
        let _spec = SelectSpec::new(None, "t_order");
    }

    #[test]
    fn test_error_types() {
        let err = Error::connection("test error");
        assert!(err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Connection);
    }
}
