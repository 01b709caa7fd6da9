//! Source/target comparison by chunk checksums

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shardline_rdbc::Value;
use tracing::{info, warn};

use super::calculator::RecordChunkCalculator;
use super::cancel::CancellationScope;
use super::checksum::ChecksumAggregator;
use super::params::ScanParameters;
use super::streaming::ChunkStream;
use crate::error::{PipelineError, Result};

/// Outcome of comparing one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCheckResult {
    /// Every chunk matched and both sides ended together
    pub matched: bool,
    /// Source rows covered by matching chunks
    pub records_checked: u64,
    /// Zero-based index of the first differing chunk
    pub mismatch_chunk: Option<usize>,
    /// Leading-key value up to which both sides are known equal
    pub last_matched_key: Option<Value>,
}

/// Walks source and target in lockstep, one checksum chunk at a time
pub struct TableInventoryChecker {
    source: Arc<RecordChunkCalculator<ChecksumAggregator>>,
    target: Arc<RecordChunkCalculator<ChecksumAggregator>>,
    scope: CancellationScope,
}

impl std::fmt::Debug for TableInventoryChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableInventoryChecker")
            .field("chunk_size", &self.source.chunk_size())
            .field("scope", &self.scope)
            .finish()
    }
}

impl TableInventoryChecker {
    /// Both calculators must use the same chunk size; they are bound to one scope
    pub fn new(
        source: RecordChunkCalculator<ChecksumAggregator>,
        target: RecordChunkCalculator<ChecksumAggregator>,
    ) -> Result<Self> {
        if source.chunk_size() != target.chunk_size() {
            return Err(PipelineError::config(format!(
                "source chunk size {} differs from target chunk size {}",
                source.chunk_size(),
                target.chunk_size()
            )));
        }
        let scope = CancellationScope::new();
        Ok(Self {
            source: Arc::new(source.with_scope(scope.clone())),
            target: Arc::new(target.with_scope(scope.clone())),
            scope,
        })
    }

    /// Stop a running check
    pub async fn cancel(&self) {
        self.scope.cancel().await;
    }

    /// Shared cancellation scope
    pub fn scope(&self) -> &CancellationScope {
        &self.scope
    }

    /// Compare the rows selected by `source` and `target`
    pub async fn check(&self, source: ScanParameters, target: ScanParameters) -> Result<TableCheckResult> {
        let table = source.table.to_string();
        info!("Checking inventory of {} against {}", table, target.table);

        let mut source_chunks = ChunkStream::new(Arc::clone(&self.source), source);
        let mut target_chunks = ChunkStream::new(Arc::clone(&self.target), target);
        let mut result = TableCheckResult {
            matched: false,
            records_checked: 0,
            mismatch_chunk: None,
            last_matched_key: None,
        };

        for index in 0.. {
            let (source_chunk, target_chunk) =
                tokio::try_join!(source_chunks.next(), target_chunks.next())?;
            match (source_chunk, target_chunk) {
                (None, None) => {
                    result.matched = true;
                    break;
                }
                (Some(s), Some(t)) if s.matches(&t) => {
                    result.records_checked += s.record_count as u64;
                    result.last_matched_key = s.max_unique_key;
                }
                (s, t) => {
                    warn!(
                        "Inventory of {} differs at chunk {} (source {:?}, target {:?})",
                        table,
                        index,
                        s.map(|c| c.record_count),
                        t.map(|c| c.record_count)
                    );
                    result.mismatch_chunk = Some(index);
                    break;
                }
            }
        }

        info!(
            "Inventory check of {} finished: matched={}, records={}",
            table, result.matched, result.records_checked
        );
        Ok(result)
    }
}
