//! Resume points a caller persists between runs
//!
//! - ScanCheckpoint: last committed lower bound of an inventory scan
//! - BinlogPosition: last applied replication event

use serde::{Deserialize, Serialize};
use shardline_rdbc::Value;

use crate::inventory::QueryRange;

/// Where an inventory scan stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanCheckpoint {
    /// Qualified table name
    pub table: String,
    /// Largest leading-key value already delivered
    pub lower_bound: Option<Value>,
    /// Whether `lower_bound` itself is still to be scanned
    #[serde(default)]
    pub lower_inclusive: bool,
}

impl ScanCheckpoint {
    /// Range that continues the scan, keeping an upper bound if the scan had one
    pub fn resume_range(&self, upper: Option<Value>) -> QueryRange {
        QueryRange::new(self.lower_bound.clone(), self.lower_inclusive, upper)
    }
}

/// Binlog file and the position of the next event to read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Binlog file name, e.g. `binlog.000029`
    pub file: String,
    /// Offset of the next event in `file`
    pub position: u64,
}

impl BinlogPosition {
    /// Create a position
    pub fn new(file: impl Into<String>, position: u64) -> Self {
        Self {
            file: file.into(),
            position,
        }
    }
}

impl std::fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.position)
    }
}
