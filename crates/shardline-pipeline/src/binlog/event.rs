//! Decoded binlog events

use serde::{Deserialize, Serialize};
use shardline_rdbc::Value;

use super::header::ColumnType;
use super::ChecksumType;

/// Where an event sits in the binlog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Binlog file the event was read from
    pub file: String,
    /// Position of the next event in `file`
    pub log_position: u64,
    /// Seconds since the epoch
    pub timestamp: u32,
    /// Originating server id
    pub server_id: u32,
}

/// Switch to a new binlog file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotateEvent {
    /// Event position
    pub meta: EventMeta,
    /// First event position in `next_file`
    pub position: u64,
    /// Name of the next file
    pub next_file: String,
}

/// First event of every binlog file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatDescriptionEvent {
    /// Event position
    pub meta: EventMeta,
    /// Binlog format version, 4 for every supported server
    pub binlog_version: u16,
    /// Server version string
    pub server_version: String,
    /// Checksum used by the events that follow
    pub checksum: ChecksumType,
}

/// One column of a mapped table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    /// Wire type
    pub column_type: ColumnType,
    /// Type metadata: length, precision/scale or fractional digits
    pub meta: u16,
    /// Whether the column accepts NULL
    pub nullable: bool,
}

impl ColumnDef {
    /// Describe a column
    pub fn new(column_type: ColumnType, meta: u16, nullable: bool) -> Self {
        Self {
            column_type,
            meta,
            nullable,
        }
    }
}

/// Table schema announced ahead of its rows events
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableMapEvent {
    /// Event position
    pub meta: EventMeta,
    /// Numeric id the rows events refer to
    pub table_id: u64,
    /// Database name
    pub schema: String,
    /// Table name
    pub table: String,
    /// Column types in table order
    pub columns: Vec<ColumnDef>,
}

impl TableMapEvent {
    /// Build a table map, e.g. to seed a decoder resuming mid-file
    pub fn new(
        table_id: u64,
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<ColumnDef>,
    ) -> Self {
        Self {
            meta: EventMeta::default(),
            table_id,
            schema: schema.into(),
            table: table.into(),
            columns,
        }
    }
}

/// Row images of a write, update or delete.
///
/// Each image holds the values of the columns present in the event, in
/// table order. Writes fill `after`, deletes fill `before`, updates fill
/// both pairwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowsEvent {
    /// Event position
    pub meta: EventMeta,
    /// Numeric table id
    pub table_id: u64,
    /// Database name from the table map
    pub schema: String,
    /// Table name from the table map
    pub table: String,
    /// Images before the change
    pub before: Vec<Vec<Value>>,
    /// Images after the change
    pub after: Vec<Vec<Value>>,
}

/// A statement logged in text form
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryEvent {
    /// Event position
    pub meta: EventMeta,
    /// Session thread id
    pub thread_id: u32,
    /// Execution time in seconds
    pub exec_time: u32,
    /// Error code the statement finished with
    pub error_code: u16,
    /// Default database of the session
    pub database: String,
    /// Statement text
    pub sql: String,
}

impl QueryEvent {
    /// Whether this statement opens a transaction
    pub fn is_begin(&self) -> bool {
        self.sql.trim().eq_ignore_ascii_case("BEGIN")
    }
}

/// Transaction commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XidEvent {
    /// Event position
    pub meta: EventMeta,
    /// Transaction id
    pub xid: u64,
}

/// Event kept only for its position
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaceholderEvent {
    /// Event position
    pub meta: EventMeta,
    /// Raw type byte
    pub type_code: u8,
}

/// A decoded binlog event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum BinlogEvent {
    Rotate(RotateEvent),
    FormatDescription(FormatDescriptionEvent),
    TableMap(TableMapEvent),
    WriteRows(RowsEvent),
    UpdateRows(RowsEvent),
    DeleteRows(RowsEvent),
    Query(QueryEvent),
    Xid(XidEvent),
    Placeholder(PlaceholderEvent),
}

impl BinlogEvent {
    /// Position of this event
    pub fn meta(&self) -> &EventMeta {
        match self {
            BinlogEvent::Rotate(e) => &e.meta,
            BinlogEvent::FormatDescription(e) => &e.meta,
            BinlogEvent::TableMap(e) => &e.meta,
            BinlogEvent::WriteRows(e) | BinlogEvent::UpdateRows(e) | BinlogEvent::DeleteRows(e) => {
                &e.meta
            }
            BinlogEvent::Query(e) => &e.meta,
            BinlogEvent::Xid(e) => &e.meta,
            BinlogEvent::Placeholder(e) => &e.meta,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            BinlogEvent::Rotate(_) => "rotate",
            BinlogEvent::FormatDescription(_) => "format_description",
            BinlogEvent::TableMap(_) => "table_map",
            BinlogEvent::WriteRows(_) => "write_rows",
            BinlogEvent::UpdateRows(_) => "update_rows",
            BinlogEvent::DeleteRows(_) => "delete_rows",
            BinlogEvent::Query(_) => "query",
            BinlogEvent::Xid(_) => "xid",
            BinlogEvent::Placeholder(_) => "placeholder",
        }
    }

    /// Row images if this is a rows event
    pub fn rows(&self) -> Option<&RowsEvent> {
        match self {
            BinlogEvent::WriteRows(e) | BinlogEvent::UpdateRows(e) | BinlogEvent::DeleteRows(e) => {
                Some(e)
            }
            _ => None,
        }
    }
}

/// What one decode step yields
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "unit", content = "events", rename_all = "snake_case")]
pub enum BinlogUnit {
    /// A single event
    Event(BinlogEvent),
    /// Events of one transaction, ending with its `Xid`
    Transaction(Vec<BinlogEvent>),
}

impl BinlogUnit {
    /// Events carried by this unit, in stream order
    pub fn events(&self) -> &[BinlogEvent] {
        match self {
            BinlogUnit::Event(event) => std::slice::from_ref(event),
            BinlogUnit::Transaction(events) => events,
        }
    }

    /// Position of the last event, the point to resume after
    pub fn last_meta(&self) -> Option<&EventMeta> {
        self.events().last().map(BinlogEvent::meta)
    }
}
