//! Per-scan resources held between chunk pulls

use std::collections::VecDeque;

use shardline_rdbc::connection::RowStream;
use shardline_rdbc::Value;

use super::record::Record;

/// Open statement and buffered rows for one in-flight scan.
///
/// Owned by exactly one [`ScanParameters`](super::ScanParameters). The
/// connection the statement runs on belongs to the caller.
#[derive(Default)]
pub struct ScanContext {
    /// Result stream of the current statement, if one is open
    pub(crate) stream: Option<Box<dyn RowStream>>,
    /// Complete duplicate runs waiting to be emitted
    pub(crate) pending: VecDeque<Record>,
    /// Run whose leading key may still continue in the stream
    pub(crate) open_run: Vec<Record>,
    /// Exclusive lower bound for the next statement
    pub(crate) fetched_upto: Option<Value>,
    /// No rows remain past `fetched_upto`
    pub(crate) exhausted: bool,
    /// Point and unbounded scans have delivered everything
    pub(crate) finished: bool,
    /// Rows read from the current statement
    pub(crate) rows_read: u64,
    /// Row limit bound into the current statement
    pub(crate) row_limit: Option<u64>,
}

impl std::fmt::Debug for ScanContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanContext")
            .field("stream_open", &self.stream.is_some())
            .field("pending", &self.pending.len())
            .field("open_run", &self.open_run.len())
            .field("fetched_upto", &self.fetched_upto)
            .field("exhausted", &self.exhausted)
            .field("finished", &self.finished)
            .field("rows_read", &self.rows_read)
            .finish()
    }
}

impl ScanContext {
    /// Attach a freshly opened statement
    pub(crate) fn open(&mut self, stream: Box<dyn RowStream>, row_limit: Option<u64>) {
        self.stream = Some(stream);
        self.rows_read = 0;
        self.row_limit = row_limit;
    }

    /// Release the statement but keep buffered rows and cursor state
    pub(crate) fn reset(&mut self) {
        self.stream = None;
    }

    /// Whether the last statement stopped because of its bound row limit
    pub(crate) fn limit_reached(&self) -> bool {
        self.row_limit.is_some_and(|limit| self.rows_read >= limit)
    }

    /// Rows buffered and not yet emitted
    pub fn buffered(&self) -> usize {
        self.pending.len() + self.open_run.len()
    }

    /// Whether a statement is currently open
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Release everything this context owns
    pub fn close(mut self) {
        self.stream = None;
        self.pending.clear();
        self.open_run.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_rdbc::connection::VecRowStream;

    #[test]
    fn test_limit_reached() {
        let mut ctx = ScanContext::default();
        assert!(!ctx.limit_reached());
        ctx.open(Box::new(VecRowStream::default()), Some(2));
        ctx.rows_read = 2;
        assert!(ctx.limit_reached());
        ctx.reset();
        assert!(!ctx.is_open());
        assert!(ctx.limit_reached());
    }
}
