//! Chunk results produced from scanned records

use shardline_rdbc::Value;

use super::record::Record;
use crate::error::Result;

/// What every chunk exposes to the scan driver
pub trait ChunkResult: Send {
    /// Largest leading-key value in the chunk, `None` for unordered chunks
    fn max_unique_key(&self) -> Option<&Value>;

    /// Rows the chunk was built from
    fn record_count(&self) -> usize;
}

/// Turns a batch of records into a downstream representation
pub trait ChunkAggregator: Send + Sync {
    /// Chunk type produced
    type Output: ChunkResult;

    /// Build a chunk; `max_unique_key` is already computed by the scan
    fn aggregate(&self, records: Vec<Record>, max_unique_key: Option<Value>) -> Result<Self::Output>;
}

/// Rows as scanned
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChunk {
    /// Records in key order
    pub records: Vec<Record>,
    /// Largest leading-key value
    pub max_unique_key: Option<Value>,
}

impl ChunkResult for RecordChunk {
    fn max_unique_key(&self) -> Option<&Value> {
        self.max_unique_key.as_ref()
    }

    fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// Keeps the rows themselves
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordAggregator;

impl ChunkAggregator for RecordAggregator {
    type Output = RecordChunk;

    fn aggregate(&self, records: Vec<Record>, max_unique_key: Option<Value>) -> Result<RecordChunk> {
        Ok(RecordChunk {
            records,
            max_unique_key,
        })
    }
}
