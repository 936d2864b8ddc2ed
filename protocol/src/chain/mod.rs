//! # Blockchain Gating
//!
//! Network messages in VERID reference the block height at which their
//! request was anchored on chain. A message can outrun its block: the queue
//! is fast, consensus is not. This module makes sure nothing is processed
//! before its height is confirmed and nothing confirmed is processed twice:
//!
//! - [`tracker`] — follows the block notification stream, detects gaps and
//!   duplicates, and owns the durable confirmed-height watermark.
//! - [`dispatcher`] — holds early messages in the pending store and releases
//!   each one exactly once, whether the height arrives before or after the
//!   message does.
//! - [`locks`] — the request-id lock set both intake paths serialize
//!   through.

pub mod dispatcher;
pub mod locks;
pub mod tracker;

pub use dispatcher::{ErrorNotifier, HeightGatedDispatcher, QueueMessage, RequestProcessor};
pub use locks::{RequestLockGuard, RequestLockSet};
pub use tracker::{BlockNotification, BlockSyncTracker};

use std::sync::Arc;

use parking_lot::RwLock;

// ---------------------------------------------------------------------------
// HeightWatermark
// ---------------------------------------------------------------------------

/// The confirmed-height watermark: the highest block height whose contents
/// have been fully dispatched to the application.
///
/// `None` is a cold start — the node has never confirmed a block. The
/// watermark has a single writer (the block sync tracker) and any number of
/// readers; readers must tolerate a stale value, which only ever *lags*
/// true chain state, never overtakes it.
#[derive(Debug, Clone, Default)]
pub struct HeightWatermark {
    inner: Arc<RwLock<Option<u64>>>,
}

impl HeightWatermark {
    /// Creates a watermark, typically seeded from
    /// [`BlockSyncTracker::recover_confirmed_height`].
    pub fn new(initial: Option<u64>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Current confirmed height, `None` on cold start.
    pub fn get(&self) -> Option<u64> {
        *self.inner.read()
    }

    /// Whether `height` is at or below the confirmed watermark. On cold
    /// start nothing is confirmed.
    pub fn is_confirmed(&self, height: u64) -> bool {
        self.get().is_some_and(|confirmed| height <= confirmed)
    }

    /// Advances the watermark. Monotonic: a lower or equal height is a
    /// no-op, so duplicate or out-of-order callers cannot move it backward.
    pub(crate) fn advance(&self, height: u64) {
        let mut guard = self.inner.write();
        if guard.map_or(true, |current| height > current) {
            *guard = Some(height);
        }
    }
}
