//! Pull-based chunk sequence over one scan

use std::sync::Arc;

use futures::stream::{self, Stream};

use super::calculator::RecordChunkCalculator;
use super::chunk::ChunkAggregator;
use super::params::ScanParameters;
use crate::checkpoint::ScanCheckpoint;
use crate::error::Result;

/// Lazy sequence of chunks for one [`ScanParameters`].
///
/// Each pull computes at most one chunk. A computed chunk is held until it is
/// taken, so repeated [`has_next`](Self::has_next) calls do not advance the
/// scan. Not safe for concurrent pulls; the `&mut self` receivers enforce that.
pub struct ChunkStream<A: ChunkAggregator> {
    calculator: Arc<RecordChunkCalculator<A>>,
    params: ScanParameters,
    memo: Option<A::Output>,
    ended: bool,
}

impl<A: ChunkAggregator> ChunkStream<A> {
    /// Sequence over `params`, driven by `calculator`
    pub fn new(calculator: Arc<RecordChunkCalculator<A>>, params: ScanParameters) -> Self {
        Self {
            calculator,
            params,
            memo: None,
            ended: false,
        }
    }

    /// Whether another chunk exists, computing it if needed
    pub async fn has_next(&mut self) -> Result<bool> {
        if self.memo.is_some() {
            return Ok(true);
        }
        if self.ended {
            return Ok(false);
        }
        match self.calculator.calculate_chunk(&mut self.params).await? {
            Some(chunk) => {
                self.memo = Some(chunk);
                Ok(true)
            }
            None => {
                self.ended = true;
                Ok(false)
            }
        }
    }

    /// Take the next chunk, `None` once the scan is complete
    pub async fn next(&mut self) -> Result<Option<A::Output>> {
        if !self.has_next().await? {
            return Ok(None);
        }
        Ok(self.memo.take())
    }

    /// Start over with a new request, dropping any unconsumed chunk
    pub fn restart(&mut self, params: ScanParameters) {
        self.params = params;
        self.memo = None;
        self.ended = false;
    }

    /// Scan request and its cursor state
    pub fn params(&self) -> &ScanParameters {
        &self.params
    }

    /// Resume point after the last computed chunk.
    ///
    /// An unconsumed memoized chunk is already reflected here, so take it
    /// before persisting.
    pub fn checkpoint(&self) -> ScanCheckpoint {
        self.params.checkpoint()
    }

    /// Whether the scan has been fully consumed
    pub fn is_ended(&self) -> bool {
        self.ended && self.memo.is_none()
    }

    /// Adapt into a `futures` stream that stops after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<A::Output>> {
        stream::unfold(self, |mut chunks| async move {
            match chunks.next().await {
                Ok(Some(chunk)) => Some((Ok(chunk), chunks)),
                Ok(None) => None,
                Err(e) => {
                    chunks.ended = true;
                    chunks.memo = None;
                    Some((Err(e), chunks))
                }
            }
        })
    }
}
