//! Decoder-side stream state

use std::collections::HashMap;

use super::event::TableMapEvent;

/// State a decoder accumulates while reading one replication stream.
///
/// Owned by exactly one decoder; seed it with table maps and the current
/// file when resuming in the middle of a binlog file.
#[derive(Debug, Clone, Default)]
pub struct BinlogContext {
    /// Trailer length after each event body
    pub checksum_length: usize,
    /// Table maps by numeric table id
    pub table_map: HashMap<u64, TableMapEvent>,
    /// File the events are currently read from
    pub file_name: String,
}

impl BinlogContext {
    /// Empty context with the given trailer length
    pub fn new(checksum_length: usize) -> Self {
        Self {
            checksum_length,
            ..Self::default()
        }
    }

    /// Seed the table map cache
    pub fn with_table_map(mut self, table_map: HashMap<u64, TableMapEvent>) -> Self {
        self.table_map = table_map;
        self
    }

    /// Seed the current file name
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    /// Cached schema for `table_id`
    pub fn table(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.table_map.get(&table_id)
    }

    /// Cache or replace a table map
    pub fn cache_table(&mut self, table: TableMapEvent) {
        self.table_map.insert(table.table_id, table);
    }
}
