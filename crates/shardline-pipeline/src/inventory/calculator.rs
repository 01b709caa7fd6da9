//! Record chunk calculator
//!
//! Produces one bounded chunk per call from a [`ScanParameters`]:
//! - Point: equality lookup, all matching rows at once
//! - Unbounded: sequential scan, no ordering
//! - Single-column range: ordered by the only key column, retried once when it runs dry
//! - Multi-column range: rows sharing a leading key value are never split across chunks
//!
//! After every range chunk the largest leading-key value becomes the exclusive
//! lower bound, so a persisted bound resumes the scan exactly where it stopped.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shardline_rdbc::connection::{Connection, RowStream};
use shardline_rdbc::Value;
use tracing::{debug, trace};

use super::cancel::CancellationScope;
use super::chunk::ChunkAggregator;
use super::context::ScanContext;
use super::params::{QueryMode, ScanParameters};
use super::query::{InventoryQueryBuilder, LowerBound};
use super::record::{max_unique_key, Record};
use crate::error::{PipelineError, Result};

/// How much a range statement may read past the current chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingRangeType {
    /// Bind `LIMIT chunk_size * streaming_chunk_count`
    #[default]
    Small,
    /// Stream to the end of the range
    Large,
}

/// Chunk calculator over a source connection.
///
/// One instance may serve many scans, but a given [`ScanParameters`] must be
/// pulled by one task at a time.
pub struct RecordChunkCalculator<A: ChunkAggregator> {
    aggregator: A,
    query_builder: Arc<dyn InventoryQueryBuilder>,
    chunk_size: usize,
    streaming_range_type: StreamingRangeType,
    streaming_chunk_count: usize,
    scope: CancellationScope,
}

impl<A: ChunkAggregator> RecordChunkCalculator<A> {
    /// Create a calculator emitting chunks of at most `chunk_size` rows
    pub fn new(aggregator: A, query_builder: Arc<dyn InventoryQueryBuilder>, chunk_size: usize) -> Self {
        Self {
            aggregator,
            query_builder,
            chunk_size: chunk_size.max(1),
            streaming_range_type: StreamingRangeType::default(),
            streaming_chunk_count: 100,
            scope: CancellationScope::new(),
        }
    }

    /// Configure how far range statements read ahead
    pub fn with_streaming(mut self, range_type: StreamingRangeType, chunk_count: usize) -> Self {
        self.streaming_range_type = range_type;
        self.streaming_chunk_count = chunk_count.max(1);
        self
    }

    /// Share a cancellation scope with other components
    pub fn with_scope(mut self, scope: CancellationScope) -> Self {
        self.scope = scope;
        self
    }

    /// Cancellation scope of this calculator
    pub fn scope(&self) -> &CancellationScope {
        &self.scope
    }

    /// Stop the calculation in progress and every later one
    pub async fn cancel(&self) {
        self.scope.cancel().await;
    }

    /// Whether a cancel was requested
    pub fn is_cancelling(&self) -> bool {
        self.scope.is_cancelling()
    }

    /// Maximum rows per chunk
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Compute the next chunk, or `None` once the scan is complete.
    ///
    /// The context is released on completion and on any error. A cancelled
    /// scan always fails with [`PipelineError::Cancelled`]; database faults
    /// become [`PipelineError::ConsistencyCheckLoadFailed`].
    pub async fn calculate_chunk(&self, params: &mut ScanParameters) -> Result<Option<A::Output>> {
        if self.scope.is_cancelling() {
            params.release_context();
            return Err(PipelineError::Cancelled);
        }

        let records = match self.collect(params).await {
            Ok(Some(records)) => records,
            Ok(None) => {
                debug!("Inventory scan of {} complete", params.table);
                params.release_context();
                return Ok(None);
            }
            Err(e) => {
                params.release_context();
                return Err(self.classify(params, e));
            }
        };

        let max_key = match params.mode {
            QueryMode::Unbounded => None,
            QueryMode::Point | QueryMode::Range => max_unique_key(&records),
        };
        if params.mode == QueryMode::Range {
            if let Some(max_key) = &max_key {
                params.advance(max_key.clone());
            }
        }
        debug!(
            "Calculated chunk of {} records from {} (max key {:?})",
            records.len(),
            params.table,
            max_key
        );
        self.aggregator.aggregate(records, max_key).map(Some)
    }

    fn classify(&self, params: &ScanParameters, error: PipelineError) -> PipelineError {
        if self.scope.is_cancelling() {
            return PipelineError::Cancelled;
        }
        match error {
            PipelineError::Cancelled | PipelineError::Unsupported(_) | PipelineError::Config(_) => {
                error
            }
            PipelineError::Rdbc(inner) => PipelineError::load_failed(params.table.to_string(), inner),
            other => PipelineError::load_failed(params.table.to_string(), other),
        }
    }

    async fn collect(&self, params: &mut ScanParameters) -> Result<Option<Vec<Record>>> {
        if params.context.is_none() {
            params.validate()?;
        }
        match params.mode {
            QueryMode::Point => self.point(params).await,
            QueryMode::Unbounded => self.unbounded(params).await,
            QueryMode::Range if params.unique_keys.len() > 1 => {
                self.multi_column_range(params).await
            }
            QueryMode::Range => self.single_column_range(params).await,
        }
    }

    fn row_limit(&self) -> Option<u64> {
        match self.streaming_range_type {
            StreamingRangeType::Small => {
                Some(self.chunk_size.saturating_mul(self.streaming_chunk_count) as u64)
            }
            StreamingRangeType::Large => None,
        }
    }

    async fn open_stream(
        &self,
        connection: Arc<dyn Connection>,
        sql: &str,
        binds: &[Value],
    ) -> Result<Box<dyn RowStream>> {
        trace!("Opening inventory statement: {}", sql);
        let stream = connection.query_stream(sql, binds).await?;
        self.scope.register_statement(stream.canceller());
        Ok(stream)
    }

    async fn open_range(
        &self,
        params: &mut ScanParameters,
        lower: Option<(Value, bool)>,
        order_by: &[String],
    ) -> Result<()> {
        let limit = self.row_limit();
        let upper = params.query_range.upper.clone();
        let bound = match &lower {
            None => LowerBound::Open,
            Some((_, true)) => LowerBound::Inclusive,
            Some((_, false)) => LowerBound::Exclusive,
        };
        let sql = self.query_builder.build_range_query(
            &params.table,
            &params.columns,
            order_by,
            bound,
            upper.is_some(),
            limit.is_some(),
        )?;

        let mut binds = Vec::with_capacity(3);
        binds.extend(lower.map(|(value, _)| value));
        binds.extend(upper);
        binds.extend(limit.map(|l| Value::Int64(l as i64)));

        let stream = self.open_stream(Arc::clone(&params.connection), &sql, &binds).await?;
        params
            .context
            .get_or_insert_with(ScanContext::default)
            .open(stream, limit);
        Ok(())
    }

    async fn next_record(&self, ctx: &mut ScanContext, key_column: Option<&str>) -> Result<Option<Record>> {
        if self.scope.is_cancelling() {
            return Err(PipelineError::Cancelled);
        }
        let Some(stream) = ctx.stream.as_mut() else {
            return Ok(None);
        };
        match stream.next().await? {
            Some(row) => {
                ctx.rows_read += 1;
                Ok(Some(Record::from_row(row, key_column)?))
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // Point
    // ========================================================================

    async fn point(&self, params: &mut ScanParameters) -> Result<Option<Vec<Record>>> {
        if params.context.as_ref().is_some_and(|ctx| ctx.finished) {
            return Ok(None);
        }
        let names = params.unique_key_names();
        let key_count = params.unique_key_values.len().min(names.len());
        let sql = self.query_builder.build_point_query(
            &params.table,
            &params.columns,
            &names[..key_count],
            &names,
            &params.sharding_column_names,
        )?;
        let binds: Vec<Value> = params
            .unique_key_values
            .iter()
            .take(key_count)
            .chain(&params.sharding_column_values)
            .cloned()
            .collect();

        let stream = self.open_stream(Arc::clone(&params.connection), &sql, &binds).await?;
        let ctx = params.context.get_or_insert_with(ScanContext::default);
        ctx.open(stream, None);

        let key_column = names.first().map(String::as_str);
        let mut records = Vec::new();
        while let Some(record) = self.next_record(ctx, key_column).await? {
            records.push(record);
        }
        ctx.reset();
        ctx.finished = true;
        Ok(Some(records))
    }

    // ========================================================================
    // Unbounded
    // ========================================================================

    async fn unbounded(&self, params: &mut ScanParameters) -> Result<Option<Vec<Record>>> {
        if params.context.as_ref().is_some_and(|ctx| ctx.finished) {
            return Ok(None);
        }
        if !params.context.as_ref().is_some_and(ScanContext::is_open) {
            let sql = self
                .query_builder
                .build_fetch_all_query(&params.table, &params.columns)?;
            let stream = self.open_stream(Arc::clone(&params.connection), &sql, &[]).await?;
            params
                .context
                .get_or_insert_with(ScanContext::default)
                .open(stream, None);
        }

        let ctx = params.context.get_or_insert_with(ScanContext::default);
        let mut records = Vec::with_capacity(self.chunk_size);
        while records.len() < self.chunk_size {
            match self.next_record(ctx, None).await? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        if records.len() < self.chunk_size {
            ctx.reset();
            ctx.finished = true;
        }
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(records))
    }

    // ========================================================================
    // Single-column range
    // ========================================================================

    async fn single_column_range(&self, params: &mut ScanParameters) -> Result<Option<Vec<Record>>> {
        let order_by = params.unique_key_names();
        let key_column = order_by[0].clone();
        let mut records: Vec<Record> = Vec::with_capacity(self.chunk_size);

        for round in 0..2 {
            if !params.context.as_ref().is_some_and(ScanContext::is_open) {
                let lower = match records.last() {
                    Some(last) => Some((last.unique_key().clone(), false)),
                    None => params
                        .query_range
                        .lower
                        .clone()
                        .map(|v| (v, params.query_range.lower_inclusive)),
                };
                self.open_range(params, lower, &order_by).await?;
            }

            let ctx = params.context.get_or_insert_with(ScanContext::default);
            while records.len() < self.chunk_size {
                match self.next_record(ctx, Some(key_column.as_str())).await? {
                    Some(record) => records.push(record),
                    None => {
                        ctx.reset();
                        break;
                    }
                }
            }
            if records.len() >= self.chunk_size {
                break;
            }
            if round == 0 {
                trace!(
                    "Range on {} drained with {} records, retrying once",
                    params.table,
                    records.len()
                );
            }
        }

        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(records))
    }

    // ========================================================================
    // Multi-column range
    // ========================================================================

    async fn multi_column_range(&self, params: &mut ScanParameters) -> Result<Option<Vec<Record>>> {
        let order_by = params.unique_key_names();
        let key_column = order_by[0].clone();
        let chunk_size = self.chunk_size;

        loop {
            let ctx = params.context.get_or_insert_with(ScanContext::default);
            if ctx.pending.len() >= chunk_size || ctx.exhausted {
                break;
            }

            if !ctx.is_open() {
                let lower = match &ctx.fetched_upto {
                    Some(fetched) => Some((fetched.clone(), false)),
                    None => params
                        .query_range
                        .lower
                        .clone()
                        .map(|v| (v, params.query_range.lower_inclusive)),
                };
                self.open_range(params, lower, &order_by).await?;
            }

            let ctx = params.context.get_or_insert_with(ScanContext::default);
            let mut boundary_run = None;
            loop {
                match self.next_record(ctx, Some(key_column.as_str())).await? {
                    Some(record) => {
                        if ctx
                            .open_run
                            .last()
                            .is_some_and(|last| !last.same_key(&record))
                        {
                            flush_open_run(ctx);
                        }
                        ctx.open_run.push(record);
                        if ctx.pending.len() >= chunk_size {
                            break;
                        }
                    }
                    None => {
                        let limited = ctx.limit_reached();
                        ctx.reset();
                        if limited {
                            // The run at the limit may continue past it.
                            boundary_run = ctx.open_run.first().map(|r| r.unique_key().clone());
                        } else {
                            flush_open_run(ctx);
                            ctx.exhausted = true;
                        }
                        break;
                    }
                }
            }

            if let Some(leading_key) = boundary_run {
                let child = params.leading_key_lookup(leading_key.clone());
                let run = self.lookup_boundary_run(child).await?;
                trace!(
                    "Requeried boundary run {:?} on {}: {} records",
                    leading_key,
                    params.table,
                    run.len()
                );
                let ctx = params.context.get_or_insert_with(ScanContext::default);
                ctx.open_run.clear();
                ctx.pending.extend(run);
                ctx.fetched_upto = Some(leading_key);
            }
        }

        let ctx = params.context.get_or_insert_with(ScanContext::default);
        let records = drain_runs(&mut ctx.pending, chunk_size);
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(records))
    }

    async fn lookup_boundary_run(&self, mut child: ScanParameters) -> Result<Vec<Record>> {
        let result = self.point(&mut child).await;
        child.release_context();
        Ok(result?.unwrap_or_default())
    }
}

fn flush_open_run(ctx: &mut ScanContext) {
    if let Some(first) = ctx.open_run.first() {
        ctx.fetched_upto = Some(first.unique_key().clone());
    }
    ctx.pending.extend(ctx.open_run.drain(..));
}

/// Take whole duplicate runs from the front while they fit in `chunk_size`.
///
/// A run longer than `chunk_size` is returned alone.
fn drain_runs(pending: &mut VecDeque<Record>, chunk_size: usize) -> Vec<Record> {
    let mut records = Vec::new();
    while let Some(front) = pending.front() {
        let run_len = pending.iter().take_while(|r| r.same_key(front)).count();
        if !records.is_empty() && records.len() + run_len > chunk_size {
            break;
        }
        records.extend(pending.drain(..run_len));
        if records.len() >= chunk_size {
            break;
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_rdbc::types::Row;

    fn pending(keys: &[i32]) -> VecDeque<Record> {
        keys.iter()
            .enumerate()
            .map(|(i, k)| {
                let row = Row::new(
                    vec!["user_id".into(), "order_id".into()],
                    vec![Value::Int32(*k), Value::Int64(i as i64)],
                );
                Record::from_row(row, Some("user_id")).unwrap()
            })
            .collect()
    }

    fn keys(records: &[Record]) -> Vec<Value> {
        records.iter().map(|r| r.unique_key().clone()).collect()
    }

    #[test]
    fn test_drain_stops_before_splitting_a_run() {
        let mut buffer = pending(&[1, 2, 3, 3, 3, 3, 3]);
        let chunk = drain_runs(&mut buffer, 4);
        assert_eq!(keys(&chunk), vec![Value::Int32(1), Value::Int32(2)]);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_oversized_run_emitted_alone() {
        let mut buffer = pending(&[3, 3, 3, 3, 3, 4]);
        let chunk = drain_runs(&mut buffer, 4);
        assert_eq!(chunk.len(), 5);
        assert_eq!(keys(&buffer.into_iter().collect::<Vec<_>>()), vec![Value::Int32(4)]);
    }

    #[test]
    fn test_drain_fills_exact_chunk() {
        let mut buffer = pending(&[1, 1, 2, 2, 3]);
        let chunk = drain_runs(&mut buffer, 4);
        assert_eq!(chunk.len(), 4);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_flush_tracks_fetched_key() {
        let mut ctx = ScanContext::default();
        ctx.open_run = pending(&[7, 7]).into_iter().collect();
        flush_open_run(&mut ctx);
        assert_eq!(ctx.fetched_upto, Some(Value::Int32(7)));
        assert_eq!(ctx.pending.len(), 2);
        assert!(ctx.open_run.is_empty());
    }
}
