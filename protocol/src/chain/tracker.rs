//! # Block Sync Tracker
//!
//! Consumes block notifications from the chain feed and turns them into
//! watermark advances plus catch-up sweeps on the dispatcher.
//!
//! Ordering matters: the in-memory watermark advances to `height` BEFORE
//! the sweep over `[last_known + 1, height]` runs. A message arriving
//! mid-sweep for a height in that window then takes the direct dispatch
//! path instead of parking behind a sweep that has already snapshotted
//! its range; the request lock set and the sweep's record-gone skip keep
//! the two paths from double-dispatching. Only the durable save happens
//! after the sweep, so a crash mid-sweep replays it on restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::chain::dispatcher::HeightGatedDispatcher;
use crate::chain::HeightWatermark;
use crate::storage::VeridDb;

// ---------------------------------------------------------------------------
// BlockNotification
// ---------------------------------------------------------------------------

/// One committed block as reported by the chain feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockNotification {
    pub height: u64,
    /// Application-state hash after this block. Used only to skip sweeps
    /// for blocks that changed nothing.
    pub app_hash: [u8; 32],
}

// ---------------------------------------------------------------------------
// BlockSyncTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TrackerState {
    /// Highest height any notification has reported.
    last_known_height: Option<u64>,
    /// Highest height durably saved. Persist failures leave this behind
    /// `last_known_height` until a later save catches up.
    last_persisted_height: Option<u64>,
    /// App hash of the previous notification, for no-op block detection.
    last_app_hash: Option<[u8; 32]>,
}

/// Tracks chain progress and drives the dispatcher's catch-up sweeps.
pub struct BlockSyncTracker {
    db: Arc<VeridDb>,
    watermark: HeightWatermark,
    dispatcher: Arc<HeightGatedDispatcher>,
    state: Mutex<TrackerState>,
    /// Blocks are ignored until the chain feed reports the node in sync.
    ready: AtomicBool,
}

impl BlockSyncTracker {
    /// Builds a tracker resuming from `recovered` (the persisted confirmed
    /// height, if any). `watermark` must have been seeded with the same
    /// value.
    pub fn new(
        db: Arc<VeridDb>,
        watermark: HeightWatermark,
        dispatcher: Arc<HeightGatedDispatcher>,
        recovered: Option<u64>,
    ) -> Self {
        Self {
            db,
            watermark,
            dispatcher,
            state: Mutex::new(TrackerState {
                last_known_height: recovered,
                last_persisted_height: recovered,
                last_app_hash: None,
            }),
            ready: AtomicBool::new(false),
        }
    }

    /// Reads the persisted confirmed height, degrading to a cold start on
    /// read failure.
    pub fn recover_confirmed_height(db: &VeridDb) -> Option<u64> {
        match db.load_confirmed_height() {
            Ok(Some(height)) => {
                info!(height, "recovered confirmed block height");
                Some(height)
            }
            Ok(None) => {
                info!("no persisted block height, starting cold");
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to read persisted block height, starting cold");
                None
            }
        }
    }

    /// Marks the node in sync with the chain. Until this is called every
    /// block notification is dropped.
    pub fn set_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!("chain feed in sync, block processing enabled");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Current confirmed height as this tracker sees it.
    pub fn confirmed_height(&self) -> Option<u64> {
        self.watermark.get()
    }

    /// Handles one block notification end to end: watermark advance, gap
    /// sweep, durable save.
    pub async fn handle_new_block(&self, block: BlockNotification) {
        if !self.is_ready() {
            debug!(height = block.height, "still syncing, dropping block notification");
            return;
        }

        let plan = {
            let mut state = self.state.lock();
            let plan = match state.last_known_height {
                Some(last) if block.height <= last => {
                    debug!(
                        height = block.height,
                        last_known = last,
                        "stale or duplicate block notification, ignoring"
                    );
                    return;
                }
                Some(last) => SweepPlan {
                    from: last + 1,
                    to: block.height,
                    missing: block.height - last - 1,
                    skip: state.last_app_hash == Some(block.app_hash),
                },
                // First block after a cold start. Nothing earlier can be
                // parked behind heights we never heard about.
                None => SweepPlan {
                    from: block.height,
                    to: block.height,
                    missing: 0,
                    skip: false,
                },
            };
            state.last_known_height = Some(block.height);
            state.last_app_hash = Some(block.app_hash);
            plan
        };

        if plan.missing > 0 {
            info!(
                height = block.height,
                missing = plan.missing,
                "catching up over missed blocks"
            );
        }

        // Advance before sweeping so an arrival for a height in the sweep
        // window dispatches directly instead of parking behind a range
        // snapshot that will never include it.
        self.watermark.advance(block.height);

        if plan.skip {
            debug!(
                height = block.height,
                app_hash = %hex::encode(block.app_hash),
                "app hash unchanged, skipping sweep"
            );
        } else {
            self.dispatcher.on_height_confirmed(plan.from, plan.to).await;
        }

        self.persist(block.height);
    }

    /// Best-effort durable save. Monotonic: a height at or below the last
    /// persisted one is never written, so a stale retry cannot regress the
    /// on-disk watermark.
    fn persist(&self, height: u64) {
        let mut state = self.state.lock();
        if state.last_persisted_height.is_some_and(|p| height <= p) {
            return;
        }
        match self.db.save_confirmed_height(height) {
            Ok(()) => {
                state.last_persisted_height = Some(height);
            }
            Err(e) => {
                error!(height, error = %e, "failed to persist confirmed block height");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SweepPlan {
    from: u64,
    to: u64,
    missing: u64,
    skip: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
