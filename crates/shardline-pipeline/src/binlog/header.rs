//! Event header and type codes

use serde::Serialize;

use super::reader::ByteReader;
use crate::error::Result;

/// Binlog event type codes the decoder distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum EventType {
    /// Any code without a dedicated decode path
    Unknown = 0,
    Query = 2,
    Rotate = 4,
    FormatDescription = 15,
    Xid = 16,
    TableMap = 19,
    WriteRowsV1 = 23,
    UpdateRowsV1 = 24,
    DeleteRowsV1 = 25,
    Heartbeat = 27,
    WriteRowsV2 = 30,
    UpdateRowsV2 = 31,
    DeleteRowsV2 = 32,
}

impl EventType {
    /// Map a header type byte
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => EventType::Query,
            4 => EventType::Rotate,
            15 => EventType::FormatDescription,
            16 => EventType::Xid,
            19 => EventType::TableMap,
            23 => EventType::WriteRowsV1,
            24 => EventType::UpdateRowsV1,
            25 => EventType::DeleteRowsV1,
            27 => EventType::Heartbeat,
            30 => EventType::WriteRowsV2,
            31 => EventType::UpdateRowsV2,
            32 => EventType::DeleteRowsV2,
            _ => EventType::Unknown,
        }
    }

    /// Whether this is a write, update or delete rows event
    pub fn is_row_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsV1
                | EventType::WriteRowsV2
                | EventType::UpdateRowsV1
                | EventType::UpdateRowsV2
                | EventType::DeleteRowsV1
                | EventType::DeleteRowsV2
        )
    }

    /// Version 2 rows events carry an extra-data block after the flags
    pub fn has_extra_row_data(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsV2 | EventType::UpdateRowsV2 | EventType::DeleteRowsV2
        )
    }
}

/// MySQL column types as written in table map events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    /// Map a column type byte; `None` for codes that never appear in row images
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => return None,
        })
    }
}

/// Binlog event header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    /// Seconds since the epoch
    pub timestamp: u32,
    /// Raw type byte
    pub type_code: u8,
    /// Originating server id
    pub server_id: u32,
    /// Header, body and checksum length
    pub event_size: u32,
    /// Position of the next event in the current file
    pub next_position: u32,
    /// Event flags
    pub flags: u16,
}

impl EventHeader {
    /// Encoded header length
    pub const SIZE: usize = 19;

    /// Parse the fixed header at the front of `data`
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        Ok(Self {
            timestamp: reader.u32_le()?,
            type_code: reader.u8()?,
            server_id: reader.u32_le()?,
            event_size: reader.u32_le()?,
            next_position: reader.u32_le()?,
            flags: reader.u16_le()?,
        })
    }

    /// Decoded event type
    pub fn event_type(&self) -> EventType {
        EventType::from_u8(self.type_code)
    }
}
