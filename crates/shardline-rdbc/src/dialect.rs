//! SQL dialect abstraction for shardline-rdbc
//!
//! Renders the ordered, parameterized SELECT statements used by inventory
//! scans through sea-query, so identifier quoting follows each backend:
//! - SqlDialect: trait for backend-specific SQL generation
//! - SelectSpec: projection, comparison predicates, ordering and a bound LIMIT
//! - Placeholders are numbered in predicate order, then the LIMIT parameter

use sea_query::{
    Alias, Asterisk, Expr, IntoIden, MysqlQueryBuilder, Order, PostgresQueryBuilder, Query,
    SelectStatement, SimpleExpr, TableRef,
};

use crate::connection::DatabaseType;

fn sea_table_ref(schema: Option<&str>, table: &str) -> TableRef {
    match schema {
        Some(s) => TableRef::SchemaTable(Alias::new(s).into_iden(), Alias::new(table).into_iden()),
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

/// Comparison used by a [`Predicate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `column = ?`
    Eq,
    /// `column > ?`
    Gt,
    /// `column >= ?`
    Ge,
    /// `column <= ?`
    Le,
}

/// A single `column <op> placeholder` condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    /// Column name (unquoted)
    pub column: String,
    /// Comparison operator
    pub op: Comparison,
}

/// Description of a parameterized SELECT
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectSpec {
    /// Schema (database for MySQL)
    pub schema: Option<String>,
    /// Table name
    pub table: String,
    /// Projected columns; empty selects `*`
    pub columns: Vec<String>,
    /// Conditions joined with AND, in binding order
    pub predicates: Vec<Predicate>,
    /// Ascending ORDER BY columns
    pub order_by: Vec<String>,
    /// Append `LIMIT <placeholder>` bound after all predicates
    pub limit_param: bool,
}

impl SelectSpec {
    /// Start a SELECT over `schema.table`
    pub fn new(schema: Option<&str>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.map(str::to_string),
            table: table.into(),
            ..Default::default()
        }
    }

    /// Set the projected columns
    pub fn with_columns(mut self, columns: &[String]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    /// Add a condition
    pub fn with_predicate(mut self, column: impl Into<String>, op: Comparison) -> Self {
        self.predicates.push(Predicate {
            column: column.into(),
            op,
        });
        self
    }

    /// Add an ascending ORDER BY column
    pub fn with_order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(column.into());
        self
    }

    /// Bind a row limit as the last parameter
    pub fn with_limit_param(mut self) -> Self {
        self.limit_param = true;
        self
    }

    /// Number of parameters the rendered statement expects
    pub fn parameter_count(&self) -> usize {
        self.predicates.len() + usize::from(self.limit_param)
    }
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Backend this dialect renders for
    fn database_type(&self) -> DatabaseType;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a 1-based parameter index
    fn placeholder(&self, index: usize) -> String;

    /// Render a sea-query statement in this dialect
    fn render(&self, stmt: &SelectStatement) -> String;

    /// Build a parameterized SELECT from a [`SelectSpec`]
    fn build_select(&self, spec: &SelectSpec) -> String {
        let mut stmt = Query::select();
        stmt.from(sea_table_ref(spec.schema.as_deref(), &spec.table));

        if spec.columns.is_empty() {
            stmt.column(Asterisk);
        } else {
            for col in &spec.columns {
                stmt.column(Alias::new(col.as_str()));
            }
        }

        for (idx, predicate) in spec.predicates.iter().enumerate() {
            let column = Expr::col(Alias::new(predicate.column.as_str()));
            let param: SimpleExpr = Expr::cust(self.placeholder(idx + 1));
            stmt.and_where(match predicate.op {
                Comparison::Eq => column.eq(param),
                Comparison::Gt => column.gt(param),
                Comparison::Ge => column.gte(param),
                Comparison::Le => column.lte(param),
            });
        }

        for col in &spec.order_by {
            stmt.order_by(Alias::new(col.as_str()), Order::Asc);
        }

        let mut sql = self.render(&stmt);
        if spec.limit_param {
            sql.push_str(" LIMIT ");
            sql.push_str(&self.placeholder(spec.predicates.len() + 1));
        }
        sql
    }
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn render(&self, stmt: &SelectStatement) -> String {
        stmt.to_string(PostgresQueryBuilder)
    }
}

/// MySQL dialect
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn render(&self, stmt: &SelectStatement) -> String {
        stmt.to_string(MysqlQueryBuilder)
    }
}

/// MariaDB dialect (MySQL wire and SQL syntax)
#[derive(Debug, Clone, Default)]
pub struct MariaDbDialect;

impl SqlDialect for MariaDbDialect {
    fn name(&self) -> &'static str {
        "MariaDB"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MariaDB
    }

    fn quote_identifier(&self, name: &str) -> String {
        MySqlDialect.quote_identifier(name)
    }

    fn placeholder(&self, index: usize) -> String {
        MySqlDialect.placeholder(index)
    }

    fn render(&self, stmt: &SelectStatement) -> String {
        MySqlDialect.render(stmt)
    }
}

/// Get a dialect by name
pub fn dialect_for(name: &str) -> Box<dyn SqlDialect> {
    match name.to_lowercase().as_str() {
        "postgres" | "postgresql" => Box::new(PostgresDialect),
        "mariadb" => Box::new(MariaDbDialect),
        _ => Box::new(MySqlDialect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_spec() -> SelectSpec {
        SelectSpec::new(Some("ds_0"), "t_order")
            .with_predicate("order_id", Comparison::Gt)
            .with_predicate("order_id", Comparison::Le)
            .with_order_by("order_id")
            .with_limit_param()
    }

    #[test]
    fn test_mysql_range_select() {
        let sql = MySqlDialect.build_select(&range_spec());
        assert!(sql.starts_with("SELECT * FROM `ds_0`.`t_order`"), "{sql}");
        assert!(sql.contains("`order_id` > ?"), "{sql}");
        assert!(sql.contains("`order_id` <= ?"), "{sql}");
        assert!(sql.contains("ORDER BY `order_id` ASC"), "{sql}");
        assert!(sql.ends_with("LIMIT ?"), "{sql}");
    }

    #[test]
    fn test_postgres_numbers_placeholders_in_binding_order() {
        let sql = PostgresDialect.build_select(&range_spec());
        assert!(sql.contains("\"order_id\" > $1"), "{sql}");
        assert!(sql.contains("\"order_id\" <= $2"), "{sql}");
        assert!(sql.ends_with("LIMIT $3"), "{sql}");
        assert_eq!(range_spec().parameter_count(), 3);
    }

    #[test]
    fn test_projection_and_equality() {
        let spec = SelectSpec::new(None, "t_order")
            .with_columns(&["order_id".to_string(), "status".to_string()])
            .with_predicate("user_id", Comparison::Eq)
            .with_order_by("user_id");
        let sql = MySqlDialect.build_select(&spec);
        assert!(sql.starts_with("SELECT `order_id`, `status` FROM `t_order`"), "{sql}");
        assert!(sql.contains("`user_id` = ?"), "{sql}");
        assert!(!sql.contains("LIMIT"));
    }

    #[test]
    fn test_dialect_selection() {
        assert_eq!(dialect_for("postgres").name(), "PostgreSQL");
        assert_eq!(dialect_for("MariaDB").name(), "MariaDB");
        assert_eq!(dialect_for("mysql").name(), "MySQL");
        assert_eq!(MySqlDialect.quote_identifier("a`b"), "`a``b`");
    }
}
