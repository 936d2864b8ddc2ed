//! # Height-Gated Dispatcher
//!
//! Routes inbound queue messages against the confirmed chain height.
//! A message declaring a height at or below the watermark is processed
//! immediately; a message ahead of the watermark is durably parked and
//! replayed by the catch-up sweep once its height confirms.
//!
//! Per-request locks guarantee the two release paths (direct dispatch on
//! arrival, sweep replay on confirmation) never run the same request
//! concurrently. A message that loses the lock race is dropped, not
//! requeued: the holder is already handling that request.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chain::locks::RequestLockSet;
use crate::chain::HeightWatermark;
use crate::storage::VeridDb;

// ---------------------------------------------------------------------------
// QueueMessage
// ---------------------------------------------------------------------------

/// A decoded application message from the queue layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Identity request this message belongs to. Lock and dedup key.
    pub request_id: String,
    /// Chain height at which the sender committed the request.
    pub height: u64,
    /// Application payload, opaque to the dispatch layer.
    pub body: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Processing Seams
// ---------------------------------------------------------------------------

/// Business-logic handler invoked once per released message.
#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    async fn process(&self, message: &QueueMessage) -> anyhow::Result<()>;
}

/// Sink for dispatch-layer failures that must not abort the pipeline.
#[async_trait]
pub trait ErrorNotifier: Send + Sync + 'static {
    async fn notify(&self, action: &str, error: &anyhow::Error, request_id: Option<&str>);
}

// ---------------------------------------------------------------------------
// HeightGatedDispatcher
// ---------------------------------------------------------------------------

/// Gate between the message queue and the request processor.
pub struct HeightGatedDispatcher {
    db: Arc<VeridDb>,
    watermark: HeightWatermark,
    locks: RequestLockSet,
    processor: Arc<dyn RequestProcessor>,
    notifier: Arc<dyn ErrorNotifier>,
}

impl HeightGatedDispatcher {
    pub fn new(
        db: Arc<VeridDb>,
        watermark: HeightWatermark,
        processor: Arc<dyn RequestProcessor>,
        notifier: Arc<dyn ErrorNotifier>,
    ) -> Self {
        Self {
            db,
            watermark,
            locks: RequestLockSet::new(),
            processor,
            notifier,
        }
    }

    /// The confirmed-height watermark this dispatcher gates on.
    pub fn watermark(&self) -> &HeightWatermark {
        &self.watermark
    }

    /// Number of requests currently locked. For tests and diagnostics.
    pub fn locked_requests(&self) -> usize {
        self.locks.len()
    }

    /// Entry point for a message arriving from the queue.
    pub async fn on_message_arrived(&self, message: QueueMessage) {
        if self.watermark.is_confirmed(message.height) {
            self.dispatch_now(&message).await;
            return;
        }
        self.park(message).await;
    }

    /// Queue path for an already-confirmed height: take the request lock
    /// and process. Losing the lock race means another path holds the
    /// request; the duplicate is dropped.
    async fn dispatch_now(&self, message: &QueueMessage) {
        let Some(_guard) = self.locks.try_acquire(&message.request_id) else {
            debug!(
                request_id = %message.request_id,
                "request already in flight, dropping duplicate"
            );
            return;
        };

        // A redelivery can find a parked record from an earlier arrival
        // whose sweep skipped it. Consume it here, or the store grows and
        // a later sweep of the same height dispatches the request again.
        if let Err(e) = self.db.delete_pending(&message.request_id) {
            warn!(
                request_id = %message.request_id,
                error = %e,
                "failed to remove stale parked record"
            );
        }

        debug!(
            request_id = %message.request_id,
            height = message.height,
            "dispatching confirmed message"
        );
        if let Err(e) = self.processor.process(message).await {
            self.notifier
                .notify("process_message", &e, Some(&message.request_id))
                .await;
        }
    }

    /// Parks a message ahead of the watermark, then re-checks: if the
    /// watermark advanced past the message height while we were writing,
    /// the sweep for that height may already have run and missed this
    /// record, so this path dispatches it itself.
    async fn park(&self, message: QueueMessage) {
        let Some(_guard) = self.locks.try_acquire(&message.request_id) else {
            debug!(
                request_id = %message.request_id,
                "request already in flight, dropping duplicate"
            );
            return;
        };

        let raw = match serde_json::to_vec(&message) {
            Ok(raw) => raw,
            Err(e) => {
                self.notifier
                    .notify(
                        "park_message",
                        &anyhow::Error::from(e),
                        Some(&message.request_id),
                    )
                    .await;
                return;
            }
        };
        if let Err(e) = self.db.put_pending(&message.request_id, message.height, &raw) {
            self.notifier
                .notify(
                    "park_message",
                    &anyhow::Error::from(e),
                    Some(&message.request_id),
                )
                .await;
            return;
        }

        info!(
            request_id = %message.request_id,
            height = message.height,
            "message parked awaiting block confirmation"
        );

        // Watermark may have crossed the height between the gate check and
        // the durable write. We still hold the lock, so a concurrent sweep
        // either skipped this request (lock held) or never saw the record;
        // either way dispatching here is the only release.
        if self.watermark.is_confirmed(message.height) {
            if let Err(e) = self.db.delete_pending(&message.request_id) {
                warn!(
                    request_id = %message.request_id,
                    error = %e,
                    "failed to remove parked record before late dispatch"
                );
            }
            debug!(
                request_id = %message.request_id,
                height = message.height,
                "height confirmed during park, dispatching immediately"
            );
            if let Err(e) = self.processor.process(&message).await {
                self.notifier
                    .notify("process_message", &e, Some(&message.request_id))
                    .await;
            }
        }
    }

    /// Catch-up sweep: replays every parked request whose height falls in
    /// `[from, to]`, then garbage-collects the height index for that
    /// window.
    ///
    /// One failing request never aborts the sweep; its error goes to the
    /// notifier and the remaining requests still run.
    pub async fn on_height_confirmed(&self, from: u64, to: u64) {
        let ids = match self.db.pending_in_range(from, to) {
            Ok(ids) => ids,
            Err(e) => {
                self.notifier
                    .notify("sweep_list_pending", &anyhow::Error::from(e), None)
                    .await;
                return;
            }
        };

        if !ids.is_empty() {
            info!(from, to, count = ids.len(), "sweeping parked requests");
        }

        for request_id in ids {
            let Some(_guard) = self.locks.try_acquire(&request_id) else {
                debug!(request_id = %request_id, "request in flight, sweep skips it");
                continue;
            };

            let record = match self.db.get_pending(&request_id) {
                Ok(Some(record)) => record,
                // Already released through the queue path.
                Ok(None) => continue,
                Err(e) => {
                    self.notifier
                        .notify("sweep_load_pending", &anyhow::Error::from(e), Some(&request_id))
                        .await;
                    continue;
                }
            };

            let message: QueueMessage = match serde_json::from_slice(&record.raw) {
                Ok(message) => message,
                Err(e) => {
                    self.notifier
                        .notify(
                            "sweep_decode_pending",
                            &anyhow::Error::from(e),
                            Some(&request_id),
                        )
                        .await;
                    continue;
                }
            };

            if let Err(e) = self.processor.process(&message).await {
                self.notifier
                    .notify("process_message", &e, Some(&request_id))
                    .await;
            }
            if let Err(e) = self.db.delete_pending(&request_id) {
                warn!(request_id = %request_id, error = %e, "failed to remove swept record");
            }
        }

        match self.db.delete_pending_range(from, to) {
            Ok(removed) if removed > 0 => {
                debug!(from, to, removed, "garbage-collected height index entries");
            }
            Ok(_) => {}
            Err(e) => {
                self.notifier
                    .notify("sweep_gc", &anyhow::Error::from(e), None)
                    .await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
