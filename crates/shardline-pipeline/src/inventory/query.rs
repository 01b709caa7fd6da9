//! SQL for inventory scans
//!
//! Parameters are bound positionally in a fixed order:
//! - range: lower bound, upper bound, then the row limit (each only when present)
//! - point: unique-key values in key order, then sharding values in declared order

use shardline_rdbc::connection::DatabaseType;
use shardline_rdbc::dialect::{dialect_for, Comparison, SelectSpec, SqlDialect};
use shardline_rdbc::security::validate_sql_identifiers;

use super::params::QualifiedTable;
use crate::error::Result;

/// How the lower side of a range query is bounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerBound {
    /// No lower predicate
    Open,
    /// `key > ?`
    Exclusive,
    /// `key >= ?`
    Inclusive,
}

/// Renders the statements a scan executes
pub trait InventoryQueryBuilder: Send + Sync {
    /// Rows ordered by `order_by`, bounded on `order_by[0]`
    fn build_range_query(
        &self,
        table: &QualifiedTable,
        columns: &[String],
        order_by: &[String],
        lower: LowerBound,
        has_upper: bool,
        limit: bool,
    ) -> Result<String>;

    /// Rows where each of `key_columns` and `sharding_columns` equals its parameter
    fn build_point_query(
        &self,
        table: &QualifiedTable,
        columns: &[String],
        key_columns: &[String],
        order_by: &[String],
        sharding_columns: &[String],
    ) -> Result<String>;

    /// Every row, unordered
    fn build_fetch_all_query(&self, table: &QualifiedTable, columns: &[String]) -> Result<String>;
}

/// Builder backed by a [`SqlDialect`]
pub struct DialectQueryBuilder {
    dialect: Box<dyn SqlDialect>,
}

impl std::fmt::Debug for DialectQueryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialectQueryBuilder")
            .field("dialect", &self.dialect.name())
            .finish()
    }
}

impl DialectQueryBuilder {
    /// Use `dialect` for rendering
    pub fn new(dialect: Box<dyn SqlDialect>) -> Self {
        Self { dialect }
    }

    /// Builder for the dialect of `database_type`
    pub fn for_database(database_type: DatabaseType) -> Self {
        Self::new(dialect_for(database_type.dialect_name()))
    }

    fn base(table: &QualifiedTable, columns: &[String]) -> Result<SelectSpec> {
        let mut names = vec![table.table.as_str()];
        names.extend(table.schema.as_deref());
        names.extend(columns.iter().map(String::as_str));
        validate_sql_identifiers(names)?;
        Ok(SelectSpec::new(table.schema.as_deref(), table.table.as_str()).with_columns(columns))
    }
}

impl InventoryQueryBuilder for DialectQueryBuilder {
    fn build_range_query(
        &self,
        table: &QualifiedTable,
        columns: &[String],
        order_by: &[String],
        lower: LowerBound,
        has_upper: bool,
        limit: bool,
    ) -> Result<String> {
        validate_sql_identifiers(order_by.iter().map(String::as_str))?;
        let mut spec = Self::base(table, columns)?;
        if let Some(first) = order_by.first() {
            match lower {
                LowerBound::Open => {}
                LowerBound::Exclusive => spec = spec.with_predicate(first, Comparison::Gt),
                LowerBound::Inclusive => spec = spec.with_predicate(first, Comparison::Ge),
            }
            if has_upper {
                spec = spec.with_predicate(first, Comparison::Le);
            }
        }
        for column in order_by {
            spec = spec.with_order_by(column);
        }
        if limit {
            spec = spec.with_limit_param();
        }
        Ok(self.dialect.build_select(&spec))
    }

    fn build_point_query(
        &self,
        table: &QualifiedTable,
        columns: &[String],
        key_columns: &[String],
        order_by: &[String],
        sharding_columns: &[String],
    ) -> Result<String> {
        validate_sql_identifiers(
            key_columns
                .iter()
                .chain(order_by)
                .chain(sharding_columns)
                .map(String::as_str),
        )?;
        let mut spec = Self::base(table, columns)?;
        for column in key_columns.iter().chain(sharding_columns) {
            spec = spec.with_predicate(column, Comparison::Eq);
        }
        for column in order_by {
            spec = spec.with_order_by(column);
        }
        Ok(self.dialect.build_select(&spec))
    }

    fn build_fetch_all_query(&self, table: &QualifiedTable, columns: &[String]) -> Result<String> {
        Ok(self.dialect.build_select(&Self::base(table, columns)?))
    }
}
