//! Error types for pipeline operations
//!
//! Scan and decode faults are classified so callers can decide between
//! resuming from a checkpoint, reconnecting, or giving up on a table.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for retry decisions and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Cooperative stop requested by the caller
    Cancelled,
    /// Database fault while loading a chunk
    Database,
    /// Replication stream fault
    Replication,
    /// Operation the engine cannot perform for this table or stream
    Unsupported,
    /// Invalid settings
    Configuration,
    /// Socket or file errors
    Network,
    /// Serialization errors
    Serialization,
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The scan or dump was stopped through its cancellation scope
    #[error("Operation cancelled")]
    Cancelled,

    /// A chunk could not be loaded from the table
    #[error("Consistency check loading failed for table {table}: {source}")]
    ConsistencyCheckLoadFailed {
        /// Qualified table name
        table: String,
        /// Underlying fault
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// No usable key, unknown mode, or unhandled event path
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Malformed bytes or an error packet on the replication stream
    #[error("Protocol decode error {code} ({sql_state}): {message}")]
    ProtocolDecode {
        /// Server error code, 0 when the fault was detected locally
        code: u16,
        /// SQLSTATE from the error packet, `HY000` when detected locally
        sql_state: String,
        /// Message text
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connectivity error outside chunk loading
    #[error("Database error: {0}")]
    Rdbc(#[from] shardline_rdbc::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Wrap a chunk-loading fault with the table it happened on
    pub fn load_failed(
        table: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ConsistencyCheckLoadFailed {
            table: table.into(),
            source: source.into(),
        }
    }

    /// Create an unsupported-operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// A fault detected while parsing replication bytes
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::ProtocolDecode {
            code: 0,
            sql_state: "HY000".to_string(),
            message: msg.into(),
        }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error was caused by cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error is retriable.
    ///
    /// Load failures are retried by rescanning from the last checkpointed
    /// lower bound. Protocol faults require a reconnect, which the caller
    /// does from the last applied binlog position.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConsistencyCheckLoadFailed { .. } => true,
            Self::ProtocolDecode { code, .. } => *code == 0,
            Self::Rdbc(e) => e.is_retriable(),
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                        | ErrorKind::UnexpectedEof
                )
            }
            Self::Cancelled | Self::Unsupported(_) | Self::Config(_) | Self::Json(_) => false,
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::ConsistencyCheckLoadFailed { .. } => ErrorCategory::Database,
            Self::Rdbc(_) => ErrorCategory::Database,
            Self::Unsupported(_) => ErrorCategory::Unsupported,
            Self::ProtocolDecode { .. } => ErrorCategory::Replication,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Io(_) => ErrorCategory::Network,
            Self::Json(_) => ErrorCategory::Serialization,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::ConsistencyCheckLoadFailed { .. } => "load_failed",
            Self::Unsupported(_) => "unsupported",
            Self::ProtocolDecode { .. } => "protocol_decode",
            Self::Config(_) => "config_error",
            Self::Rdbc(_) => "database_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
