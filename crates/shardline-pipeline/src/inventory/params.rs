//! Scan request types
//!
//! A [`ScanParameters`] describes one table scan and carries its cursor state
//! (the current lower bound) plus the open [`ScanContext`] between chunk pulls.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shardline_rdbc::connection::Connection;
use shardline_rdbc::security::validate_sql_identifiers;
use shardline_rdbc::Value;

use super::context::ScanContext;
use crate::checkpoint::ScanCheckpoint;
use crate::error::{PipelineError, Result};

/// Table name with an optional schema (database for MySQL)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedTable {
    /// Schema or database name
    pub schema: Option<String>,
    /// Table name
    pub table: String,
}

impl QualifiedTable {
    /// Create a qualified table reference
    pub fn new(schema: Option<&str>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.map(str::to_string),
            table: table.into(),
        }
    }

    /// Parse `schema.table` or a bare `table`
    pub fn parse(name: &str) -> Self {
        match name.split_once('.') {
            Some((schema, table)) => Self::new(Some(schema), table),
            None => Self::new(None, name),
        }
    }
}

impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => f.write_str(&self.table),
        }
    }
}

/// One column of the unique key a scan is ordered by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueKeyColumn {
    /// Column name
    pub name: String,
    /// Vendor type name, informational
    pub data_type: String,
}

impl UniqueKeyColumn {
    /// Create a key column
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// How rows are selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Equality lookup on unique-key values
    Point,
    /// Ordered scan between two key bounds
    Range,
    /// Whole table, no ordering
    Unbounded,
}

/// Bounds on the first unique-key column.
///
/// `None` means open on that side. The upper bound is always inclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRange {
    /// Lower bound
    pub lower: Option<Value>,
    /// Whether rows equal to `lower` are included
    pub lower_inclusive: bool,
    /// Inclusive upper bound
    pub upper: Option<Value>,
}

impl QueryRange {
    /// Create a range
    pub fn new(lower: Option<Value>, lower_inclusive: bool, upper: Option<Value>) -> Self {
        Self {
            lower,
            lower_inclusive,
            upper,
        }
    }

    /// A range open on both sides
    pub fn full() -> Self {
        Self::default()
    }

    /// Rows strictly after `lower`, used when resuming from a checkpoint
    pub fn after(lower: Value) -> Self {
        Self::new(Some(lower), false, None)
    }
}

/// Request for a chunked scan over one table.
///
/// Not safe for concurrent use: exactly one task pulls chunks for a given
/// instance. The connection is borrowed from the caller and never closed here;
/// only the statement held by the context is released.
pub struct ScanParameters {
    /// Source connection
    pub connection: Arc<dyn Connection>,
    /// Scanned table
    pub table: QualifiedTable,
    /// Projected columns, empty for all
    pub columns: Vec<String>,
    /// Ordering key columns, first column drives chunk boundaries
    pub unique_keys: Vec<UniqueKeyColumn>,
    /// Selection mode
    pub mode: QueryMode,
    /// Current bounds, advanced after every range chunk
    pub query_range: QueryRange,
    /// Key values for point lookups, in key order
    pub unique_key_values: Vec<Value>,
    /// Extra equality predicates
    pub sharding_column_names: Vec<String>,
    /// Values for the sharding predicates
    pub sharding_column_values: Vec<Value>,
    /// Open per-scan state
    pub context: Option<ScanContext>,
}

impl fmt::Debug for ScanParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanParameters")
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("unique_keys", &self.unique_keys)
            .field("mode", &self.mode)
            .field("query_range", &self.query_range)
            .field("unique_key_values", &self.unique_key_values)
            .field("sharding_column_names", &self.sharding_column_names)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

impl ScanParameters {
    fn with_mode(connection: Arc<dyn Connection>, table: QualifiedTable, mode: QueryMode) -> Self {
        Self {
            connection,
            table,
            columns: Vec::new(),
            unique_keys: Vec::new(),
            mode,
            query_range: QueryRange::default(),
            unique_key_values: Vec::new(),
            sharding_column_names: Vec::new(),
            sharding_column_values: Vec::new(),
            context: None,
        }
    }

    /// Ordered scan between `range` bounds
    pub fn range(
        connection: Arc<dyn Connection>,
        table: QualifiedTable,
        unique_keys: Vec<UniqueKeyColumn>,
        range: QueryRange,
    ) -> Self {
        let mut params = Self::with_mode(connection, table, QueryMode::Range);
        params.unique_keys = unique_keys;
        params.query_range = range;
        params
    }

    /// Equality lookup on a prefix of the unique key
    pub fn point(
        connection: Arc<dyn Connection>,
        table: QualifiedTable,
        unique_keys: Vec<UniqueKeyColumn>,
        unique_key_values: Vec<Value>,
    ) -> Self {
        let mut params = Self::with_mode(connection, table, QueryMode::Point);
        params.unique_keys = unique_keys;
        params.unique_key_values = unique_key_values;
        params
    }

    /// Whole-table scan without ordering
    pub fn unbounded(connection: Arc<dyn Connection>, table: QualifiedTable) -> Self {
        Self::with_mode(connection, table, QueryMode::Unbounded)
    }

    /// Restrict the projection
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    /// Add equality predicates on sharding columns
    pub fn with_sharding(mut self, names: Vec<String>, values: Vec<Value>) -> Self {
        self.sharding_column_names = names;
        self.sharding_column_values = values;
        self
    }

    /// Names of the unique key columns in declared order
    pub fn unique_key_names(&self) -> Vec<String> {
        self.unique_keys.iter().map(|k| k.name.clone()).collect()
    }

    /// The key column that drives chunk boundaries
    pub fn first_unique_key(&self) -> Option<&UniqueKeyColumn> {
        self.unique_keys.first()
    }

    /// Check the invariants a mode relies on before any query is issued
    pub fn validate(&self) -> Result<()> {
        let mut names: Vec<&str> = vec![self.table.table.as_str()];
        names.extend(self.table.schema.as_deref());
        names.extend(self.columns.iter().map(String::as_str));
        names.extend(self.unique_keys.iter().map(|k| k.name.as_str()));
        names.extend(self.sharding_column_names.iter().map(String::as_str));
        validate_sql_identifiers(names)?;

        if self.sharding_column_names.len() != self.sharding_column_values.len() {
            return Err(PipelineError::config(format!(
                "{} sharding columns but {} values",
                self.sharding_column_names.len(),
                self.sharding_column_values.len()
            )));
        }
        match self.mode {
            QueryMode::Range | QueryMode::Point if self.unique_keys.is_empty() => {
                Err(PipelineError::unsupported(format!(
                    "table {} has no unique key for {:?} scans",
                    self.table, self.mode
                )))
            }
            QueryMode::Point
                if self.unique_key_values.is_empty()
                    || self.unique_key_values.len() > self.unique_keys.len() =>
            {
                Err(PipelineError::config(format!(
                    "point lookup on {} needs 1..={} key values, got {}",
                    self.table,
                    self.unique_keys.len(),
                    self.unique_key_values.len()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Move the lower bound past the last key of a produced chunk
    pub fn advance(&mut self, max_unique_key: Value) {
        self.query_range.lower = Some(max_unique_key);
        self.query_range.lower_inclusive = false;
    }

    /// Drop the open statement and any buffered rows
    pub fn release_context(&mut self) {
        if let Some(context) = self.context.take() {
            context.close();
        }
    }

    /// State a caller persists to resume this scan later
    pub fn checkpoint(&self) -> ScanCheckpoint {
        ScanCheckpoint {
            table: self.table.to_string(),
            lower_bound: self.query_range.lower.clone(),
            lower_inclusive: self.query_range.lower_inclusive,
        }
    }

    /// Point lookup for every row sharing `leading_key`, run with its own context
    pub(crate) fn leading_key_lookup(&self, leading_key: Value) -> Self {
        let mut child = Self::point(
            Arc::clone(&self.connection),
            self.table.clone(),
            self.unique_keys.clone(),
            vec![leading_key],
        );
        child.columns = self.columns.clone();
        child.sharding_column_names = self.sharding_column_names.clone();
        child.sharding_column_values = self.sharding_column_values.clone();
        child
    }
}

impl Drop for ScanParameters {
    fn drop(&mut self) {
        self.release_context();
    }
}
