//! # Retry Engine
//!
//! The per-message state machine that turns the unreliable transport into
//! guaranteed delivery. Every outbound message is retransmitted on a fixed
//! interval until the peer's ack arrives or a total timeout declares the
//! delivery dead — whichever comes first, exactly once.
//!
//! The engine performs no I/O. It emits [`RetryEvent`]s on a channel and the
//! consumer (the node runtime) performs the actual network writes. This
//! keeps the timer path free of fallible operations: the only thing a timer
//! can do is emit an event, so errors in the retry machinery itself are
//! impossible by construction.
//!
//! ## State machine (per outbound message)
//!
//! ```text
//!              ┌────────────── retry interval, timeout not reached ──┐
//!              │                                                     │
//! Send ──> Pending ── ack ──> removed, PerformCleanUp(seq_id)        │
//!              │                                                     │
//!              └── total timeout ──> removed, PerformTotalTimeout ───┘
//! ```
//!
//! Sequence ids are per-destination, start at 1, and are never reused —
//! even for messages that expired. A receiver can therefore detect
//! duplicates and gaps per sender with a single counter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{DEFAULT_RETRY_INTERVAL, DEFAULT_TOTAL_TIMEOUT};

/// Unique identifier of one logical send call.
pub type MessageId = Uuid;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timing knobs for the retry engine.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Pause between retransmissions of an unacknowledged message.
    pub retry_interval: Duration,

    /// Total time since the first send after which the engine gives up,
    /// drops the message state, and emits `PerformTotalTimeout`.
    pub total_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Side-effect instructions emitted by the engine.
///
/// The consumer performs them in order. `PerformSend` may repeat for the
/// same message id; the terminal events fire at most once per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// Write this payload to the wire, first transmission and retries alike.
    PerformSend {
        dest: String,
        payload: Bytes,
        msg_id: MessageId,
        seq_id: u64,
    },

    /// The message was acknowledged; release any per-sequence resources.
    PerformCleanUp { seq_id: u64 },

    /// Delivery gave up. Terminal; no further `PerformSend` will follow
    /// for this message id.
    PerformTotalTimeout { msg_id: MessageId, dest: String },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One live outbound message: everything a retry tick needs to re-send it,
/// plus the timer task handle so an ack can cancel it atomically.
struct OutboundEntry {
    dest: String,
    payload: Bytes,
    seq_id: u64,
    timer: JoinHandle<()>,
}

/// Mutable engine state behind one mutex: the outbound table and the
/// per-destination sequence counters.
#[derive(Default)]
struct EngineState {
    outbound: HashMap<MessageId, OutboundEntry>,
    next_seq: HashMap<String, u64>,
}

/// The retry engine. Cheap to clone; all clones share one outbound table.
///
/// Must be used from within a tokio runtime — `send` spawns the message's
/// retry timer task.
#[derive(Clone)]
pub struct RetryEngine {
    config: RetryConfig,
    state: Arc<Mutex<EngineState>>,
    events: mpsc::UnboundedSender<RetryEvent>,
}

impl RetryEngine {
    /// Creates an engine and the event stream its side effects arrive on.
    pub fn new(config: RetryConfig) -> (Self, mpsc::UnboundedReceiver<RetryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                state: Arc::new(Mutex::new(EngineState::default())),
                events,
            },
            rx,
        )
    }

    /// Enqueues a message for reliable delivery.
    ///
    /// Assigns the next sequence id for `dest`, emits the initial
    /// `PerformSend`, and starts the retry timer. Returns the message id
    /// the caller can correlate acks and timeouts with.
    pub fn send(&self, dest: &str, payload: Bytes) -> MessageId {
        let msg_id = Uuid::new_v4();

        let seq_id = {
            let mut state = self.state.lock();
            let seq = state.next_seq.entry(dest.to_string()).or_insert(0);
            *seq += 1;
            let seq_id = *seq;

            let timer = self.spawn_timer(msg_id);
            state.outbound.insert(
                msg_id,
                OutboundEntry {
                    dest: dest.to_string(),
                    payload: payload.clone(),
                    seq_id,
                    timer,
                },
            );
            seq_id
        };

        debug!(%msg_id, dest, seq_id, "queueing outbound message");
        let _ = self.events.send(RetryEvent::PerformSend {
            dest: dest.to_string(),
            payload,
            msg_id,
            seq_id,
        });
        msg_id
    }

    /// Handles an acknowledgment from the peer.
    ///
    /// Cancels the retry timer, drops the message state, and emits
    /// `PerformCleanUp`. Idempotent: unknown ids — including messages that
    /// already expired or were already acked — are silently ignored.
    pub fn ack_received(&self, msg_id: MessageId) {
        let removed = self.state.lock().outbound.remove(&msg_id);
        if let Some(entry) = removed {
            entry.timer.abort();
            debug!(%msg_id, seq_id = entry.seq_id, "outbound message acknowledged");
            let _ = self.events.send(RetryEvent::PerformCleanUp {
                seq_id: entry.seq_id,
            });
        }
    }

    /// Number of messages still awaiting acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.state.lock().outbound.len()
    }

    /// Cancels every live retry timer and drops all outbound state without
    /// emitting events. For shutdown only.
    pub fn close(&self) {
        let mut state = self.state.lock();
        for (_, entry) in state.outbound.drain() {
            entry.timer.abort();
        }
    }

    /// Spawns the retry timer for one message: re-send every
    /// `retry_interval`, give up at `total_timeout`. The deadline branch is
    /// listed first under `biased` so that a timeout landing on the same
    /// instant as a retry tick expires the message instead of re-sending it.
    fn spawn_timer(&self, msg_id: MessageId) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let retry_interval = self.config.retry_interval;
        let total_timeout = self.config.total_timeout;

        tokio::spawn(async move {
            let start = Instant::now();
            let mut ticks = tokio::time::interval_at(start + retry_interval, retry_interval);
            let deadline = tokio::time::sleep_until(start + total_timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;

                    _ = &mut deadline => {
                        let removed = state.lock().outbound.remove(&msg_id);
                        if let Some(entry) = removed {
                            warn!(
                                %msg_id,
                                dest = %entry.dest,
                                seq_id = entry.seq_id,
                                "delivery gave up after total timeout"
                            );
                            let _ = events.send(RetryEvent::PerformTotalTimeout {
                                msg_id,
                                dest: entry.dest,
                            });
                        }
                        return;
                    }

                    _ = ticks.tick() => {
                        let pending = {
                            let state = state.lock();
                            state.outbound.get(&msg_id).map(|entry| {
                                (entry.dest.clone(), entry.payload.clone(), entry.seq_id)
                            })
                        };
                        match pending {
                            Some((dest, payload, seq_id)) => {
                                debug!(%msg_id, dest = %dest, seq_id, "retrying unacknowledged message");
                                let _ = events.send(RetryEvent::PerformSend {
                                    dest,
                                    payload,
                                    msg_id,
                                    seq_id,
                                });
                            }
                            // Acked between ticks; the abort just hasn't
                            // landed yet.
                            None => return,
                        }
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
