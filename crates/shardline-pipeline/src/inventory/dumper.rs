//! Inventory dumper
//!
//! Pages a table in unique-key order and pushes batches of [`DumpRecord`]s to a
//! bounded channel. A terminal [`IngestPosition::Finished`] record closes the
//! dump so the consumer knows incremental capture can take over.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shardline_rdbc::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::calculator::RecordChunkCalculator;
use super::cancel::CancellationScope;
use super::chunk::RecordAggregator;
use super::params::{QueryMode, ScanParameters};
use super::query::InventoryQueryBuilder;
use super::streaming::ChunkStream;
use crate::config::{DumperConfig, InventoryConfig};
use crate::error::{PipelineError, Result};

/// Progress marker attached to every dumped record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestPosition {
    /// Record key and the inclusive end of the dumped range
    UniqueKey {
        /// Leading-key value of this record, `None` for unordered dumps
        begin: Option<Value>,
        /// Upper bound of the dump
        end: Option<Value>,
    },
    /// Every row of the table has been dumped
    Finished,
}

/// One dumped row
#[derive(Debug, Clone, PartialEq)]
pub struct DumpRecord {
    /// Column names
    pub columns: Vec<String>,
    /// Column values
    pub values: Vec<Value>,
    /// Position after this record
    pub position: IngestPosition,
}

impl DumpRecord {
    /// End-of-dump marker
    pub fn finished() -> Self {
        Self {
            columns: Vec::new(),
            values: Vec::new(),
            position: IngestPosition::Finished,
        }
    }

    /// Whether this is the end-of-dump marker
    pub fn is_finished(&self) -> bool {
        self.position == IngestPosition::Finished
    }
}

/// Copies a table's inventory into a channel
pub struct InventoryDumper {
    calculator: Arc<RecordChunkCalculator<RecordAggregator>>,
    channel_capacity: usize,
}

impl InventoryDumper {
    /// Build a dumper whose batches hold `dumper.batch_size` records
    pub fn new(
        query_builder: Arc<dyn InventoryQueryBuilder>,
        dumper: &DumperConfig,
        inventory: &InventoryConfig,
    ) -> Self {
        let calculator = RecordChunkCalculator::new(RecordAggregator, query_builder, dumper.batch_size)
            .with_streaming(inventory.streaming_range_type, inventory.streaming_chunk_count);
        Self {
            calculator: Arc::new(calculator),
            channel_capacity: dumper.channel_capacity.max(1),
        }
    }

    /// Cancellation scope shared with the running dump
    pub fn scope(&self) -> &CancellationScope {
        self.calculator.scope()
    }

    /// Stop the dump; the running task ends with [`PipelineError::Cancelled`]
    pub async fn stop(&self) {
        info!("Stopping inventory dump");
        self.calculator.cancel().await;
    }

    /// Run the dump on its own task
    pub fn spawn(
        self: &Arc<Self>,
        params: ScanParameters,
    ) -> (mpsc::Receiver<Vec<DumpRecord>>, JoinHandle<Result<u64>>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let dumper = Arc::clone(self);
        let handle = tokio::spawn(async move { dumper.dump(params, tx).await });
        (rx, handle)
    }

    /// Dump every row selected by `params`, returning the number of rows sent.
    ///
    /// A range request on a table without a unique key falls back to an
    /// unordered fetch-all scan.
    pub async fn dump(&self, params: ScanParameters, tx: mpsc::Sender<Vec<DumpRecord>>) -> Result<u64> {
        let table = params.table.to_string();
        let result = self.dump_inner(params, &tx).await;
        match &result {
            Ok(rows) => info!("Inventory dump of {} finished: {} rows", table, rows),
            Err(PipelineError::Cancelled) => info!("Inventory dump of {} cancelled", table),
            Err(e) => error!("inventory dump failed on {}: {}", table, e),
        }
        result
    }

    async fn dump_inner(&self, params: ScanParameters, tx: &mpsc::Sender<Vec<DumpRecord>>) -> Result<u64> {
        let params = if params.mode == QueryMode::Range && params.unique_keys.is_empty() {
            info!(
                "Table {} has no unique key, dumping without ordering",
                params.table
            );
            ScanParameters::unbounded(Arc::clone(&params.connection), params.table.clone())
                .with_columns(params.columns.clone())
        } else {
            params
        };
        let ordered = params.mode != QueryMode::Unbounded;
        let end = params.query_range.upper.clone();
        info!("Dumping inventory of {} ({:?})", params.table, params.mode);

        let mut chunks = ChunkStream::new(Arc::clone(&self.calculator), params);
        let mut total = 0u64;
        while let Some(chunk) = chunks.next().await? {
            let batch: Vec<DumpRecord> = chunk
                .records
                .into_iter()
                .map(|record| {
                    let begin = ordered.then(|| record.unique_key().clone());
                    let (columns, values) = record.into_row().into_parts();
                    DumpRecord {
                        columns,
                        values,
                        position: IngestPosition::UniqueKey {
                            begin,
                            end: end.clone(),
                        },
                    }
                })
                .collect();
            total += batch.len() as u64;
            send(tx, batch).await?;
        }
        send(tx, vec![DumpRecord::finished()]).await?;
        Ok(total)
    }
}

async fn send(tx: &mpsc::Sender<Vec<DumpRecord>>, batch: Vec<DumpRecord>) -> Result<()> {
    tx.send(batch).await.map_err(|_| PipelineError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_marker() {
        let marker = DumpRecord::finished();
        assert!(marker.is_finished());
        assert!(marker.columns.is_empty());
    }

    #[test]
    fn test_position_json_shape() {
        let json = serde_json::to_value(IngestPosition::UniqueKey {
            begin: Some(Value::Int64(3)),
            end: None,
        })
        .unwrap();
        assert_eq!(json["type"], "unique_key");
        assert_eq!(
            serde_json::to_value(IngestPosition::Finished).unwrap()["type"],
            "finished"
        );
    }
}
