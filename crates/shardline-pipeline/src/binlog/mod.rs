//! MySQL binlog decoding
//!
//! Turns the byte stream of a `COM_BINLOG_DUMP` connection into row-change
//! events:
//! - `BinlogFrameDecoder`: reframing, per-type dispatch and transaction grouping
//! - `BinlogContext`: checksum length, table map cache and current file
//! - `BinlogClient` / `BinlogEventStream`: replication handshake and the read loop
//!
//! # Example
//!
//! ```rust,ignore
//! use shardline_pipeline::binlog::{BinlogClient, BinlogFrameDecoder};
//!
//! let client = BinlogClient::connect(&config).await?;
//! let mut events = client.start(&config, BinlogFrameDecoder::from_config(&config)).await?;
//! while let Some(unit) = events.next().await? {
//!     println!("{:?} at {}", unit, events.position());
//! }
//! ```

mod client;
mod context;
mod decoder;
mod event;
mod header;
mod reader;
mod rows;

use serde::{Deserialize, Serialize};

pub use client::{BinlogClient, BinlogEventStream};
pub use context::BinlogContext;
pub use decoder::BinlogFrameDecoder;
pub use event::{
    BinlogEvent, BinlogUnit, ColumnDef, EventMeta, FormatDescriptionEvent, PlaceholderEvent,
    QueryEvent, RotateEvent, RowsEvent, TableMapEvent, XidEvent,
};
pub use header::{ColumnType, EventHeader, EventType};
pub use reader::ByteReader;

/// Checksum algorithm appended to every event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumType {
    /// No trailer
    None,
    /// 4-byte CRC32 trailer
    #[default]
    Crc32,
}

impl ChecksumType {
    /// Trailer length in bytes
    pub fn length(&self) -> usize {
        match self {
            ChecksumType::None => 0,
            ChecksumType::Crc32 => 4,
        }
    }

    /// Map the algorithm byte of a format description event
    pub fn from_algorithm(alg: u8) -> Self {
        if alg == 1 {
            ChecksumType::Crc32
        } else {
            ChecksumType::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_lengths() {
        assert_eq!(ChecksumType::default().length(), 4);
        assert_eq!(ChecksumType::None.length(), 0);
        assert_eq!(ChecksumType::from_algorithm(1), ChecksumType::Crc32);
        assert_eq!(ChecksumType::from_algorithm(0), ChecksumType::None);
        assert_eq!(ChecksumType::from_algorithm(0xff), ChecksumType::None);
    }
}
