//! Cooperative cancellation with a forceful statement interrupt

use std::sync::Arc;

use parking_lot::Mutex;
use shardline_rdbc::connection::QueryCanceller;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cancellation shared by a calculator and whoever may stop it.
///
/// The token is authoritative: scans poll [`is_cancelling`](Self::is_cancelling)
/// on every row. Interrupting the registered statement only unblocks a call
/// that is waiting on the network and may fail without consequence.
#[derive(Clone, Default)]
pub struct CancellationScope {
    token: CancellationToken,
    statement: Arc<Mutex<Option<Arc<dyn QueryCanceller>>>>,
}

impl std::fmt::Debug for CancellationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationScope")
            .field("cancelled", &self.token.is_cancelled())
            .field("has_statement", &self.statement.lock().is_some())
            .finish()
    }
}

impl CancellationScope {
    /// Create an uncancelled scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and interrupt the registered statement, if still open
    pub async fn cancel(&self) {
        self.token.cancel();
        let statement = self.statement.lock().clone();
        let Some(statement) = statement else {
            return;
        };
        if statement.is_closed() {
            debug!("registered statement already closed, nothing to interrupt");
            return;
        }
        if let Err(e) = statement.cancel().await {
            warn!("forceful statement cancel failed, relying on cooperative stop: {}", e);
        }
    }

    /// Whether a cancel was requested
    pub fn is_cancelling(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Track the statement a forceful cancel should interrupt.
    ///
    /// Replaces any earlier registration.
    pub fn register_statement(&self, statement: Option<Arc<dyn QueryCanceller>>) {
        *self.statement.lock() = statement;
    }

    /// Token for `select!`-style waiting on cancellation
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
