//! MySQL backend implementation for shardline-rdbc
//!
//! Provides MySQL-specific implementations:
//! - Connection with buffered and streaming queries
//! - Statement interruption through `KILL QUERY` on a side connection
//! - Table metadata and unique key discovery for inventory scans

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, DatabaseType, QueryCanceller, RowStream};
use crate::error::{Error, Result};
use crate::types::{ColumnMetadata, Row, TableMetadata, Value};

/// `ER_QUERY_INTERRUPTED`
const ER_QUERY_INTERRUPTED: u16 = 1317;

/// Convert a shardline Value to a MySQL compatible parameter
fn value_to_sql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int8(n) => mysql_async::Value::from(*n),
        Value::Int16(n) => mysql_async::Value::from(*n),
        Value::Int32(n) => mysql_async::Value::from(*n),
        Value::Int64(n) => mysql_async::Value::from(*n),
        Value::Float32(n) => mysql_async::Value::from(*n),
        Value::Float64(n) => mysql_async::Value::from(*n),
        Value::Decimal(d) => mysql_async::Value::from(d.to_string()),
        Value::String(s) => mysql_async::Value::from(s.clone()),
        Value::Bytes(b) | Value::Bit(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1000,
        ),
        Value::DateTime(dt) => datetime_to_sql(dt),
        Value::DateTimeTz(dt) => datetime_to_sql(&dt.naive_utc()),
        Value::Uuid(u) => mysql_async::Value::from(u.to_string()),
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
        Value::Interval(micros) => {
            let negative = *micros < 0;
            let total = micros.unsigned_abs();
            let secs = total / 1_000_000;
            mysql_async::Value::Time(
                negative,
                (secs / 86_400) as u32,
                ((secs % 86_400) / 3600) as u8,
                ((secs % 3600) / 60) as u8,
                (secs % 60) as u8,
                (total % 1_000_000) as u32,
            )
        }
        Value::Enum(n) => mysql_async::Value::from(*n),
        Value::Set(bits) => mysql_async::Value::from(*bits),
    }
}

fn datetime_to_sql(dt: &chrono::NaiveDateTime) -> mysql_async::Value {
    mysql_async::Value::Date(
        dt.year() as u16,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
        dt.nanosecond() / 1000,
    )
}

/// Convert a MySQL value to a shardline Value
fn mysql_value_to_value(val: mysql_async::Value) -> Value {
    match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => match String::from_utf8(b) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
        mysql_async::Value::Int(n) => Value::Int64(n),
        mysql_async::Value::UInt(n) => match i64::try_from(n) {
            Ok(n) => Value::Int64(n),
            Err(_) => Value::Decimal(rust_decimal::Decimal::from(n)),
        },
        mysql_async::Value::Float(f) => Value::Float32(f),
        mysql_async::Value::Double(d) => Value::Float64(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let Some(date) = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            else {
                return Value::Null;
            };
            if hour == 0 && min == 0 && sec == 0 && micro == 0 {
                Value::Date(date)
            } else {
                chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                    .map(|time| Value::DateTime(date.and_time(time)))
                    .unwrap_or(Value::Null)
            }
        }
        mysql_async::Value::Time(neg, days, hour, min, sec, micro) => {
            let total_hours = days * 24 + hour as u32;
            if !neg && total_hours < 24 {
                chrono::NaiveTime::from_hms_micro_opt(total_hours, min as u32, sec as u32, micro)
                    .map(Value::Time)
                    .unwrap_or(Value::Null)
            } else {
                let micros = (total_hours as i64 * 3600 + min as i64 * 60 + sec as i64)
                    * 1_000_000
                    + micro as i64;
                Value::Interval(if neg { -micros } else { micros })
            }
        }
    }
}

fn convert_row(row: mysql_async::Row) -> Row {
    let columns: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();
    let values: Vec<Value> = (0..row.len())
        .map(|i| mysql_value_to_value(row.get(i).unwrap_or(mysql_async::Value::NULL)))
        .collect();
    Row::new(columns, values)
}

fn driver_error(context: &str, err: mysql_async::Error) -> Error {
    if let mysql_async::Error::Server(server) = &err {
        if server.code == ER_QUERY_INTERRUPTED {
            return Error::interrupted(format!("{}: {}", context, server.message));
        }
    }
    if matches!(err, mysql_async::Error::Io(_)) {
        return Error::connection_with_source(context, err);
    }
    Error::query_with_source(context, err)
}

/// MySQL connection implementation
pub struct MySqlConnection {
    conn: Arc<Mutex<Option<Conn>>>,
    opts: Opts,
    database: String,
    connection_id: u32,
    stream_buffer_rows: usize,
}

impl MySqlConnection {
    /// Get the database name this connection is connected to
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Server-side thread id of this session
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Create a new connection from configuration
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let url = url::Url::parse(&config.url)
            .map_err(|e| Error::config(format!("Invalid MySQL URL: {}", e)))?;
        let database = url.path().trim_start_matches('/').to_string();

        let opts: Opts = OptsBuilder::from_opts(
            Opts::from_url(&config.url)
                .map_err(|e| Error::config(format!("Invalid MySQL connection string: {}", e)))?,
        )
        .into();

        let conn = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            Conn::new(opts.clone()),
        )
        .await
        .map_err(|_| Error::timeout(format!("connecting to {:?}", config)))?
        .map_err(|e| driver_error("Failed to connect to MySQL", e))?;

        let connection_id = conn.id();
        debug!(connection_id, database = %database, "MySQL connection established");

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            opts,
            database,
            connection_id,
            stream_buffer_rows: config.stream_buffer_rows.max(1),
        })
    }

    async fn take_conn(&self) -> Result<Conn> {
        self.conn
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::connection("Connection not available"))
    }

    async fn put_conn(&self, conn: Conn) {
        *self.conn.lock().await = Some(conn);
    }

    /// Load column metadata with primary key ordinals.
    ///
    /// `schema` defaults to the database named in the connection URL.
    pub async fn table_metadata(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Option<TableMetadata>> {
        let schema_name = schema.unwrap_or(&self.database).to_string();
        let rows = self
            .query(
                r#"
                SELECT
                    c.COLUMN_NAME,
                    c.DATA_TYPE,
                    c.IS_NULLABLE,
                    c.ORDINAL_POSITION,
                    k.ORDINAL_POSITION AS PK_POSITION
                FROM INFORMATION_SCHEMA.COLUMNS c
                LEFT JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
                    ON k.TABLE_SCHEMA = c.TABLE_SCHEMA
                    AND k.TABLE_NAME = c.TABLE_NAME
                    AND k.COLUMN_NAME = c.COLUMN_NAME
                    AND k.CONSTRAINT_NAME = 'PRIMARY'
                WHERE c.TABLE_SCHEMA = ? AND c.TABLE_NAME = ?
                ORDER BY c.ORDINAL_POSITION
                "#,
                &[
                    Value::String(schema_name.clone()),
                    Value::String(table.to_string()),
                ],
            )
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut metadata = TableMetadata::new(table);
        metadata.schema = Some(schema_name);
        metadata.columns = rows
            .into_iter()
            .map(|row| {
                let name = row
                    .get_by_name("COLUMN_NAME")
                    .and_then(Value::as_string)
                    .unwrap_or_default();
                let data_type = row
                    .get_by_name("DATA_TYPE")
                    .and_then(Value::as_string)
                    .unwrap_or_default()
                    .to_lowercase();
                let mut column = ColumnMetadata::new(name, data_type);
                column.nullable = row
                    .get_by_name("IS_NULLABLE")
                    .and_then(Value::as_string)
                    .map(|s| s == "YES")
                    .unwrap_or(true);
                column.ordinal = row
                    .get_by_name("ORDINAL_POSITION")
                    .and_then(Value::as_i64)
                    .unwrap_or(0) as u32;
                column.primary_key_ordinal = row
                    .get_by_name("PK_POSITION")
                    .and_then(Value::as_i64)
                    .map(|n| n as u32);
                column
            })
            .collect();

        Ok(Some(metadata))
    }

    /// Columns of the first unique index whose columns are all NOT NULL.
    ///
    /// Used when a table has no primary key. Returns an empty list when no
    /// such index exists.
    pub async fn unique_key_columns(&self, schema: Option<&str>, table: &str) -> Result<Vec<String>> {
        let schema_name = schema.unwrap_or(&self.database).to_string();
        let rows = self
            .query(
                r#"
                SELECT s.INDEX_NAME, s.COLUMN_NAME
                FROM INFORMATION_SCHEMA.STATISTICS s
                WHERE s.TABLE_SCHEMA = ? AND s.TABLE_NAME = ? AND s.NON_UNIQUE = 0
                  AND s.INDEX_NAME NOT IN (
                      SELECT s2.INDEX_NAME FROM INFORMATION_SCHEMA.STATISTICS s2
                      WHERE s2.TABLE_SCHEMA = s.TABLE_SCHEMA AND s2.TABLE_NAME = s.TABLE_NAME
                        AND s2.NULLABLE = 'YES')
                ORDER BY s.INDEX_NAME = 'PRIMARY' DESC, s.INDEX_NAME, s.SEQ_IN_INDEX
                "#,
                &[
                    Value::String(schema_name),
                    Value::String(table.to_string()),
                ],
            )
            .await?;

        let mut selected: Option<String> = None;
        let mut columns = Vec::new();
        for row in rows {
            let index = row.get(0).and_then(Value::as_string).unwrap_or_default();
            let column = row.get(1).and_then(Value::as_string).unwrap_or_default();
            match &selected {
                None => selected = Some(index),
                Some(current) if *current != index => break,
                Some(_) => {}
            }
            columns.push(column);
        }
        Ok(columns)
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn execute(&self, query: &str, params: &[Value]) -> Result<u64> {
        let mut conn = self.take_conn().await?;
        let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();

        let outcome = conn.exec_drop(query, mysql_params).await;
        let affected = conn.affected_rows();
        self.put_conn(conn).await;

        outcome.map_err(|e| driver_error("Failed to execute query", e))?;
        Ok(affected)
    }

    async fn query(&self, query: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.take_conn().await?;
        let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();

        let outcome: std::result::Result<Vec<mysql_async::Row>, _> =
            conn.exec(query, mysql_params).await;
        self.put_conn(conn).await;

        let rows = outcome.map_err(|e| driver_error("Failed to execute query", e))?;
        Ok(rows.into_iter().map(convert_row).collect())
    }

    async fn query_stream(&self, query: &str, params: &[Value]) -> Result<Box<dyn RowStream>> {
        let guard = self.conn.clone().lock_owned().await;
        if guard.is_none() {
            return Err(Error::connection("Connection not available"));
        }

        let (tx, rx) = mpsc::channel(self.stream_buffer_rows);
        let canceller = Arc::new(MySqlQueryCanceller {
            opts: self.opts.clone(),
            connection_id: self.connection_id,
            closed: Arc::new(AtomicBool::new(false)),
        });
        let params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();

        tokio::spawn(stream_rows(
            guard,
            query.to_string(),
            params,
            tx,
            canceller.clone(),
        ));

        Ok(Box::new(MySqlRowStream { rx, canceller }))
    }

    async fn is_valid(&self) -> bool {
        match self.conn.lock().await.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.disconnect()
                .await
                .map_err(|e| driver_error("Failed to close connection", e))?;
        }
        Ok(())
    }
}

/// Drive one statement on the session held by `guard`, forwarding rows.
///
/// If the consumer goes away before the result set ends the statement is
/// killed so draining the rest of the result is cheap.
async fn stream_rows(
    mut guard: OwnedMutexGuard<Option<Conn>>,
    sql: String,
    params: Vec<mysql_async::Value>,
    tx: mpsc::Sender<Result<Row>>,
    canceller: Arc<MySqlQueryCanceller>,
) {
    let outcome = match guard.as_mut() {
        Some(conn) => forward_rows(conn, &sql, params, &tx, &canceller).await,
        None => Err(Error::connection("Connection not available")),
    };
    canceller.closed.store(true, Ordering::Release);

    if let Err(err) = outcome {
        // Consumer may already be gone; nothing else to report to.
        let _ = tx.send(Err(err)).await;
    }
}

async fn forward_rows(
    conn: &mut Conn,
    sql: &str,
    params: Vec<mysql_async::Value>,
    tx: &mpsc::Sender<Result<Row>>,
    canceller: &MySqlQueryCanceller,
) -> Result<()> {
    let mut result = conn
        .exec_iter(sql, params)
        .await
        .map_err(|e| driver_error("Failed to execute streaming query", e))?;

    let mut abandoned = false;
    while let Some(row) = result
        .next()
        .await
        .map_err(|e| driver_error("Failed to read streamed row", e))?
    {
        if tx.send(Ok(convert_row(row))).await.is_err() {
            abandoned = true;
            break;
        }
    }

    if abandoned {
        if let Err(e) = canceller.cancel().await {
            warn!(error = %e, "Failed to interrupt abandoned streaming query");
        }
        if let Err(e) = result.drop_result().await {
            debug!(error = %e, "Abandoned streaming query ended with error");
        }
        return Ok(());
    }

    result
        .drop_result()
        .await
        .map_err(|e| driver_error("Failed to finish streaming query", e))
}

/// Row stream fed by a background task that owns the session
struct MySqlRowStream {
    rx: mpsc::Receiver<Result<Row>>,
    canceller: Arc<MySqlQueryCanceller>,
}

impl RowStream for MySqlRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(Ok(row)) => Ok(Some(row)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
    }

    fn canceller(&self) -> Option<Arc<dyn QueryCanceller>> {
        Some(self.canceller.clone())
    }
}

/// Interrupts a statement with `KILL QUERY` from a short-lived side connection
pub struct MySqlQueryCanceller {
    opts: Opts,
    connection_id: u32,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl QueryCanceller for MySqlQueryCanceller {
    async fn cancel(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let mut side = Conn::new(self.opts.clone())
            .await
            .map_err(|e| driver_error("Failed to open cancel connection", e))?;
        let outcome = side
            .query_drop(format!("KILL QUERY {}", self.connection_id))
            .await;
        if let Err(e) = side.disconnect().await {
            debug!(error = %e, "Failed to close cancel connection");
        }
        outcome.map_err(|e| driver_error("KILL QUERY failed", e))?;
        debug!(connection_id = self.connection_id, "Issued KILL QUERY");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip_through_driver_types() {
        assert_eq!(
            mysql_value_to_value(value_to_sql(&Value::Int64(-5))),
            Value::Int64(-5)
        );
        assert_eq!(
            mysql_value_to_value(value_to_sql(&Value::String("SUCCESS".into()))),
            Value::String("SUCCESS".into())
        );
    }

    #[test]
    fn test_non_utf8_bytes_stay_binary() {
        let v = mysql_value_to_value(mysql_async::Value::Bytes(vec![0xff, 0xfe]));
        assert_eq!(v, Value::Bytes(vec![0xff, 0xfe]));
    }

    #[test]
    fn test_large_unsigned_becomes_decimal() {
        let v = mysql_value_to_value(mysql_async::Value::UInt(u64::MAX));
        assert_eq!(v, Value::Decimal(rust_decimal::Decimal::from(u64::MAX)));
    }

    #[test]
    fn test_negative_time_is_interval() {
        let v = mysql_value_to_value(mysql_async::Value::Time(true, 1, 2, 0, 0, 0));
        assert_eq!(v, Value::Interval(-26 * 3600 * 1_000_000));
        assert_eq!(
            mysql_value_to_value(value_to_sql(&Value::Interval(-26 * 3600 * 1_000_000))),
            v
        );
    }

    #[test]
    fn test_date_and_datetime_mapping() {
        let date = mysql_value_to_value(mysql_async::Value::Date(2024, 2, 29, 0, 0, 0, 0));
        assert!(matches!(date, Value::Date(_)));
        let dt = mysql_value_to_value(mysql_async::Value::Date(2024, 2, 29, 1, 2, 3, 4));
        assert!(matches!(dt, Value::DateTime(_)));
        let invalid = mysql_value_to_value(mysql_async::Value::Date(0, 0, 0, 0, 0, 0, 0));
        assert!(invalid.is_null());
    }
}
