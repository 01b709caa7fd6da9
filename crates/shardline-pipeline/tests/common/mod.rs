//! In-memory database for inventory scan tests
//!
//! `PlanQueryBuilder` renders JSON plans instead of SQL and `MemoryConnection`
//! evaluates them over a fixed set of rows, so chunking can be tested without
//! a server.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use shardline_pipeline::inventory::{InventoryQueryBuilder, LowerBound, QualifiedTable, UniqueKeyColumn};
use shardline_pipeline::Result;
use shardline_rdbc::connection::{Connection, DatabaseType, QueryCanceller, RowStream};
use shardline_rdbc::types::Row;
use shardline_rdbc::{Error, Value};

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("shardline_pipeline=debug")
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Query plans
// ============================================================================

/// Renders each statement as a JSON document understood by [`MemoryConnection`]
#[derive(Debug, Default)]
pub struct PlanQueryBuilder;

impl InventoryQueryBuilder for PlanQueryBuilder {
    fn build_range_query(
        &self,
        table: &QualifiedTable,
        columns: &[String],
        order_by: &[String],
        lower: LowerBound,
        has_upper: bool,
        limit: bool,
    ) -> Result<String> {
        let lower = match lower {
            LowerBound::Open => "open",
            LowerBound::Exclusive => "exclusive",
            LowerBound::Inclusive => "inclusive",
        };
        Ok(json!({
            "kind": "range",
            "table": table.to_string(),
            "columns": columns,
            "order_by": order_by,
            "lower": lower,
            "has_upper": has_upper,
            "limit": limit,
        })
        .to_string())
    }

    fn build_point_query(
        &self,
        table: &QualifiedTable,
        columns: &[String],
        key_columns: &[String],
        order_by: &[String],
        sharding_columns: &[String],
    ) -> Result<String> {
        Ok(json!({
            "kind": "point",
            "table": table.to_string(),
            "columns": columns,
            "key_columns": key_columns,
            "order_by": order_by,
            "sharding_columns": sharding_columns,
        })
        .to_string())
    }

    fn build_fetch_all_query(&self, table: &QualifiedTable, columns: &[String]) -> Result<String> {
        Ok(json!({
            "kind": "all",
            "table": table.to_string(),
            "columns": columns,
        })
        .to_string())
    }
}

fn strings(plan: &serde_json::Value, field: &str) -> Vec<String> {
    plan[field]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Connection
// ============================================================================

/// One table held in memory, rows in insertion order
pub struct MemoryConnection {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    statements: Mutex<Vec<(String, Vec<Value>)>>,
    fail_on_statement: Option<usize>,
    empty_on_statement: Option<usize>,
    cancels: Arc<AtomicUsize>,
}

impl MemoryConnection {
    pub fn new(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            statements: Mutex::new(Vec::new()),
            fail_on_statement: None,
            empty_on_statement: None,
            cancels: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the n-th statement (zero-based) with a query error
    pub fn failing_on(mut self, statement: usize) -> Self {
        self.fail_on_statement = Some(statement);
        self
    }

    /// Return no rows for the n-th statement (zero-based), as if the table
    /// was emptied just before it ran
    pub fn empty_on(mut self, statement: usize) -> Self {
        self.empty_on_statement = Some(statement);
        self
    }

    /// Statements executed so far, with their binds
    pub fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.statements.lock().clone()
    }

    pub fn statement_count(&self) -> usize {
        self.statements.lock().len()
    }

    /// Number of forceful cancels received by open statements
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(AtomicOrdering::SeqCst)
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    fn sort(&self, rows: &mut [Vec<Value>], order_by: &[String]) {
        let indexes: Vec<usize> = order_by
            .iter()
            .filter_map(|name| self.column_index(name))
            .collect();
        rows.sort_by(|a, b| {
            indexes
                .iter()
                .map(|&i| a[i].compare(&b[i]).unwrap_or(Ordering::Equal))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }

    fn project(&self, rows: Vec<Vec<Value>>, columns: &[String]) -> Vec<Row> {
        if columns.is_empty() {
            return rows
                .into_iter()
                .map(|values| Row::new(self.columns.clone(), values))
                .collect();
        }
        let indexes: Vec<usize> = columns
            .iter()
            .filter_map(|name| self.column_index(name))
            .collect();
        rows.into_iter()
            .map(|values| {
                let projected = indexes.iter().map(|&i| values[i].clone()).collect();
                Row::new(columns.to_vec(), projected)
            })
            .collect()
    }

    fn evaluate(&self, plan: &serde_json::Value, params: &[Value]) -> shardline_rdbc::Result<Vec<Row>> {
        let columns = strings(plan, "columns");
        let mut rows = self.rows.clone();
        match plan["kind"].as_str() {
            Some("all") => {}
            Some("range") => {
                let order_by = strings(plan, "order_by");
                let key = order_by
                    .first()
                    .and_then(|name| self.column_index(name))
                    .ok_or_else(|| Error::query("range plan without a known key column"))?;
                let mut binds = params.iter();
                match plan["lower"].as_str() {
                    Some("exclusive") => {
                        let bound = binds.next().cloned().unwrap_or(Value::Null);
                        rows.retain(|r| r[key].compare(&bound) == Some(Ordering::Greater));
                    }
                    Some("inclusive") => {
                        let bound = binds.next().cloned().unwrap_or(Value::Null);
                        rows.retain(|r| r[key].compare(&bound) != Some(Ordering::Less));
                    }
                    _ => {}
                }
                if plan["has_upper"].as_bool() == Some(true) {
                    let bound = binds.next().cloned().unwrap_or(Value::Null);
                    rows.retain(|r| r[key].compare(&bound) != Some(Ordering::Greater));
                }
                self.sort(&mut rows, &order_by);
                if plan["limit"].as_bool() == Some(true) {
                    let limit = binds.next().and_then(Value::as_i64).unwrap_or(0);
                    rows.truncate(limit.max(0) as usize);
                }
            }
            Some("point") => {
                let predicates: Vec<String> = strings(plan, "key_columns")
                    .into_iter()
                    .chain(strings(plan, "sharding_columns"))
                    .collect();
                for (name, bound) in predicates.iter().zip(params) {
                    let index = self
                        .column_index(name)
                        .ok_or_else(|| Error::query(format!("unknown column {}", name)))?;
                    rows.retain(|r| r[index].compare(bound) == Some(Ordering::Equal));
                }
                self.sort(&mut rows, &strings(plan, "order_by"));
            }
            other => return Err(Error::query(format!("unknown plan kind {:?}", other))),
        }
        Ok(self.project(rows, &columns))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn query(&self, sql: &str, params: &[Value]) -> shardline_rdbc::Result<Vec<Row>> {
        let mut stream = self.query_stream(sql, params).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> shardline_rdbc::Result<u64> {
        Err(Error::unsupported("memory tables are read-only"))
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> shardline_rdbc::Result<Box<dyn RowStream>> {
        let index = {
            let mut statements = self.statements.lock();
            statements.push((sql.to_string(), params.to_vec()));
            statements.len() - 1
        };
        if self.fail_on_statement == Some(index) {
            return Err(Error::query_with_sql("simulated failure", sql));
        }
        let plan: serde_json::Value = serde_json::from_str(sql)
            .map_err(|e| Error::query(format!("not a plan: {}", e)))?;
        let rows = if self.empty_on_statement == Some(index) {
            Vec::new()
        } else {
            self.evaluate(&plan, params)?
        };
        Ok(Box::new(MemoryStream {
            rows: rows.into(),
            canceller: Arc::new(MemoryCanceller {
                cancelled: AtomicBool::new(false),
                cancels: Arc::clone(&self.cancels),
            }),
        }))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> shardline_rdbc::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Streams
// ============================================================================

struct MemoryCanceller {
    cancelled: AtomicBool,
    cancels: Arc<AtomicUsize>,
}

#[async_trait]
impl QueryCanceller for MemoryCanceller {
    async fn cancel(&self) -> shardline_rdbc::Result<()> {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
        self.cancels.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }
}

struct MemoryStream {
    rows: VecDeque<Row>,
    canceller: Arc<MemoryCanceller>,
}

impl RowStream for MemoryStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = shardline_rdbc::Result<Option<Row>>> + Send + '_>> {
        let result = if self.canceller.cancelled.load(AtomicOrdering::SeqCst) {
            Err(Error::interrupted("statement cancelled"))
        } else {
            Ok(self.rows.pop_front())
        };
        Box::pin(async move { result })
    }

    fn canceller(&self) -> Option<Arc<dyn QueryCanceller>> {
        Some(Arc::clone(&self.canceller) as Arc<dyn QueryCanceller>)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn int_key(name: &str) -> UniqueKeyColumn {
    UniqueKeyColumn::new(name, "INT")
}

/// `t_order(user_id, order_id, status)` with a run of five rows for user 3
pub fn t_order() -> MemoryConnection {
    let pairs = [(1, 1), (2, 2), (3, 3), (3, 4), (3, 5), (3, 6), (3, 7), (4, 8), (5, 9), (6, 10)];
    let rows = pairs
        .iter()
        .map(|&(user_id, order_id)| {
            vec![
                Value::Int32(user_id),
                Value::Int64(order_id),
                Value::String("OK".into()),
            ]
        })
        .collect();
    MemoryConnection::new(&["user_id", "order_id", "status"], rows)
}

/// `test3(id, name)` with ids `1..=count`
pub fn sequential(count: i64) -> MemoryConnection {
    let rows = (1..=count)
        .map(|id| vec![Value::Int64(id), Value::String(format!("row-{}", id))])
        .collect();
    MemoryConnection::new(&["id", "name"], rows)
}

pub fn table(name: &str) -> QualifiedTable {
    QualifiedTable::new(Some("ds_0"), name)
}
