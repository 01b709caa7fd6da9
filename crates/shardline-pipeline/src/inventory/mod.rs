//! Inventory scans
//!
//! Deterministic, resumable, chunked reads of a source table for bulk copy and
//! consistency checks:
//! - `ScanParameters` / `ScanContext`: the request, its cursor and open statement
//! - `CancellationScope`: cooperative flag plus forceful statement interrupt
//! - `RecordChunkCalculator`: point, unbounded and range chunking
//! - `ChunkStream`: one chunk per pull, memoized until taken
//! - `TableInventoryChecker` / `InventoryDumper`: the two consumers of chunks

mod calculator;
mod cancel;
mod check;
mod checksum;
mod chunk;
mod context;
mod dumper;
mod params;
mod query;
mod record;
mod streaming;

pub use calculator::{RecordChunkCalculator, StreamingRangeType};
pub use cancel::CancellationScope;
pub use check::{TableCheckResult, TableInventoryChecker};
pub use checksum::{ChecksumAggregator, ChecksumChunk};
pub use chunk::{ChunkAggregator, ChunkResult, RecordAggregator, RecordChunk};
pub use context::ScanContext;
pub use dumper::{DumpRecord, IngestPosition, InventoryDumper};
pub use params::{QualifiedTable, QueryMode, QueryRange, ScanParameters, UniqueKeyColumn};
pub use query::{DialectQueryBuilder, InventoryQueryBuilder, LowerBound};
pub use record::{max_unique_key, Record};
pub use streaming::ChunkStream;
