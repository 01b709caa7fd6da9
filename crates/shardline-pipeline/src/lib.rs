//! # shardline-pipeline
//!
//! Data-movement engine for live database migration and resharding.
//!
//! ## Features
//!
//! - **Inventory scans**: resumable, chunked reads of a table in unique-key
//!   order that never split rows sharing a leading key value
//! - **Consistency checks**: source and target walked in lockstep, chunk by
//!   chunk, comparing CRC32 checksums
//! - **Inventory dumps**: batches pushed to a bounded channel, closed by a
//!   `Finished` marker
//! - **Binlog decoding**: `tokio_util` codec from replication packets to row
//!   events, optionally grouped into whole transactions
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  chunks   ┌────────────────────┐
//! │ source table │ ────────▶ │ ChunkStream        │ ──▶ checker / dumper
//! └──────────────┘           │  RecordChunkCalc.  │
//!                            └────────────────────┘
//! ┌──────────────┐  packets  ┌────────────────────┐
//! │ MySQL binlog │ ────────▶ │ BinlogFrameDecoder │ ──▶ events / transactions
//! └──────────────┘           └────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shardline_pipeline::prelude::*;
//!
//! let calculator = Arc::new(RecordChunkCalculator::new(
//!     RecordAggregator,
//!     Arc::new(DialectQueryBuilder::for_database(DatabaseType::MySQL)),
//!     1000,
//! ));
//! let params = ScanParameters::range(conn, QualifiedTable::new(Some("ds_0"), "t_order"), keys, QueryRange::full());
//! let mut chunks = ChunkStream::new(calculator, params);
//! while let Some(chunk) = chunks.next().await? {
//!     println!("{} rows up to {:?}", chunk.records.len(), chunk.max_unique_key);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod binlog;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod inventory;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{ErrorCategory, PipelineError, Result};

    pub use crate::checkpoint::{BinlogPosition, ScanCheckpoint};
    pub use crate::config::{
        BinlogConfig, DataSourceConfig, DumperConfig, InventoryConfig, PipelineConfig,
    };

    pub use crate::inventory::{
        CancellationScope, ChecksumAggregator, ChecksumChunk, ChunkStream, DialectQueryBuilder,
        DumpRecord, IngestPosition, InventoryDumper, InventoryQueryBuilder, QualifiedTable,
        QueryMode, QueryRange, RecordAggregator, RecordChunk, RecordChunkCalculator,
        ScanParameters, StreamingRangeType, TableCheckResult, TableInventoryChecker,
        UniqueKeyColumn,
    };

    pub use crate::binlog::{
        BinlogClient, BinlogContext, BinlogEvent, BinlogEventStream, BinlogFrameDecoder,
        BinlogUnit, ChecksumType,
    };
}

pub use error::{PipelineError, Result};
