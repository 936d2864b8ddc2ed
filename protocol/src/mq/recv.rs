//! # Receive Controller
//!
//! The inbound half of the message queue. For every decodable data frame it
//! does two things, in this order:
//!
//! 1. Send the ack back to the sender over the same transport binding.
//!    The ack confirms *wire receipt only* — it is deliberately not
//!    contingent on whatever the application later does with the payload.
//! 2. Republish `{sender_id, msg_id, payload}` to the application layer.
//!
//! Inbound ack frames are routed into the local [`RetryEngine`], closing
//! the delivery loop for our own outbound messages. Undecodable bytes are
//! logged and dropped without an ack — the sender's retry timer will take
//! it from there. Transport-level errors pass through untouched: receive
//! problems never mutate the sender-side retry bookkeeping.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::envelope::Frame;
use super::retry::{MessageId, RetryEngine};
use super::transport::{Transport, TransportError, TransportEvent};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A data message delivered to the application layer, already acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Node id the sender wrote into the envelope.
    pub sender_id: String,
    /// The sender's message id, useful for application-level tracing.
    pub msg_id: MessageId,
    /// The opaque payload.
    pub payload: Bytes,
}

/// What the controller republishes to the application.
#[derive(Debug)]
pub enum RecvEvent {
    /// A data frame arrived and was acknowledged.
    Message(InboundMessage),
    /// The transport reported a receive-side error.
    Error(TransportError),
}

// ---------------------------------------------------------------------------
// ReceiveController
// ---------------------------------------------------------------------------

/// Wraps a transport's inbound stream with ack-then-republish semantics.
pub struct ReceiveController<T: Transport> {
    transport: Arc<T>,
    retry: RetryEngine,
    events: mpsc::UnboundedSender<RecvEvent>,
}

impl<T: Transport> ReceiveController<T> {
    /// Creates the controller and the application-facing event stream.
    ///
    /// `retry` is the engine for *our* outbound messages — inbound ack
    /// frames are delivered to it.
    pub fn new(
        transport: Arc<T>,
        retry: RetryEngine,
    ) -> (Self, mpsc::UnboundedReceiver<RecvEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                retry,
                events,
            },
            rx,
        )
    }

    /// Consumes transport events until the stream ends or shutdown fires.
    pub async fn run(
        &self,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("receive controller shutting down");
                        return;
                    }
                }
                event = inbound.recv() => match event {
                    None => {
                        debug!("transport inbound stream closed, receive controller exiting");
                        return;
                    }
                    Some(TransportEvent::Incoming { bytes, reply_to }) => {
                        self.handle_incoming(bytes, &reply_to).await;
                    }
                    Some(TransportEvent::Error(e)) => {
                        // Pass through; retry/ack state is governed solely
                        // by ack round-trips.
                        let _ = self.events.send(RecvEvent::Error(e));
                    }
                }
            }
        }
    }

    /// Decodes one inbound frame and applies the ack-then-republish rule.
    async fn handle_incoming(&self, bytes: Bytes, reply_to: &str) {
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, from = reply_to, "dropping undecodable frame");
                return;
            }
        };

        match frame {
            Frame::Data {
                sender_id,
                msg_id,
                seq_id,
                payload,
            } => {
                self.send_ack(msg_id, seq_id, reply_to).await;
                debug!(%msg_id, seq_id, sender_id = %sender_id, "inbound message acknowledged");
                let _ = self.events.send(RecvEvent::Message(InboundMessage {
                    sender_id,
                    msg_id,
                    payload: payload.into(),
                }));
            }
            Frame::Ack { msg_id, seq_id } => {
                debug!(%msg_id, seq_id, "inbound ack");
                self.retry.ack_received(msg_id);
            }
        }
    }

    /// Best-effort ack. A lost ack is indistinguishable from a lost data
    /// frame to the peer — its retry engine re-sends and we ack again.
    async fn send_ack(&self, msg_id: MessageId, seq_id: u64, reply_to: &str) {
        let ack = Frame::Ack { msg_id, seq_id };
        match ack.encode() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(reply_to, bytes).await {
                    warn!(error = %e, %msg_id, to = reply_to, "failed to send ack");
                }
            }
            Err(e) => warn!(error = %e, %msg_id, "failed to encode ack"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::retry::{RetryConfig, RetryEvent};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    /// Transport stub that records every send.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, Bytes)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, addr: &str, bytes: Bytes) -> Result<(), TransportError> {
            self.sent.lock().push((addr.to_string(), bytes));
            Ok(())
        }
    }

    struct Harness {
        transport: Arc<RecordingTransport>,
        retry: RetryEngine,
        retry_events: mpsc::UnboundedReceiver<RetryEvent>,
        inbound_tx: mpsc::UnboundedSender<TransportEvent>,
        recv_events: mpsc::UnboundedReceiver<RecvEvent>,
        shutdown_tx: watch::Sender<bool>,
    }

    /// Spins up a controller over a recording transport and returns every
    /// handle a test needs to poke it.
    fn setup() -> Harness {
        let transport = Arc::new(RecordingTransport::default());
        let (retry, retry_events) = RetryEngine::new(RetryConfig {
            retry_interval: Duration::from_secs(3600),
            total_timeout: Duration::from_secs(7200),
        });
        let (controller, recv_events) =
            ReceiveController::new(Arc::clone(&transport), retry.clone());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            controller.run(inbound_rx, shutdown_rx).await;
        });

        Harness {
            transport,
            retry,
            retry_events,
            inbound_tx,
            recv_events,
            shutdown_tx,
        }
    }

    // -- 1. acks_then_republishes -------------------------------------------

    #[tokio::test]
    async fn acks_then_republishes() {
        let mut h = setup();

        let msg_id = Uuid::new_v4();
        let frame = Frame::data("idp-3", msg_id, 5, b"request body");
        h.inbound_tx
            .send(TransportEvent::Incoming {
                bytes: frame.encode().unwrap(),
                reply_to: "10.0.0.9:5555".to_string(),
            })
            .unwrap();

        let event = h.recv_events.recv().await.expect("recv event");
        match event {
            RecvEvent::Message(m) => {
                assert_eq!(m.sender_id, "idp-3");
                assert_eq!(m.msg_id, msg_id);
                assert_eq!(&m.payload[..], b"request body");
            }
            RecvEvent::Error(e) => panic!("unexpected error event: {e}"),
        }

        // The ack went back to the sender's reply address before the
        // republish landed.
        let sent = h.transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "10.0.0.9:5555");
        let ack = Frame::decode(&sent[0].1).unwrap();
        assert_eq!(ack, Frame::Ack { msg_id, seq_id: 5 });

        let _ = h.shutdown_tx.send(true);
    }

    // -- 2. undecodable_bytes_dropped_without_ack ----------------------------

    #[tokio::test]
    async fn undecodable_bytes_dropped_without_ack() {
        let mut h = setup();

        h.inbound_tx
            .send(TransportEvent::Incoming {
                bytes: Bytes::from_static(b"not a frame"),
                reply_to: "10.0.0.9:5555".to_string(),
            })
            .unwrap();

        // Follow with a valid frame; if the garbage had produced anything,
        // it would be observed first.
        let frame = Frame::data("rp-1", Uuid::new_v4(), 1, b"ok");
        h.inbound_tx
            .send(TransportEvent::Incoming {
                bytes: frame.encode().unwrap(),
                reply_to: "10.0.0.9:5555".to_string(),
            })
            .unwrap();

        match h.recv_events.recv().await.unwrap() {
            RecvEvent::Message(m) => assert_eq!(&m.payload[..], b"ok"),
            RecvEvent::Error(e) => panic!("unexpected error event: {e}"),
        }
        // Exactly one ack on the wire — none for the garbage.
        assert_eq!(h.transport.sent.lock().len(), 1);

        let _ = h.shutdown_tx.send(true);
    }

    // -- 3. inbound_ack_reaches_retry_engine ---------------------------------

    #[tokio::test]
    async fn inbound_ack_reaches_retry_engine() {
        let mut h = setup();

        let msg_id = h.retry.send("rp-9", Bytes::from_static(b"outbound"));
        assert!(matches!(
            h.retry_events.recv().await.unwrap(),
            RetryEvent::PerformSend { .. }
        ));

        let ack = Frame::Ack { msg_id, seq_id: 1 };
        h.inbound_tx
            .send(TransportEvent::Incoming {
                bytes: ack.encode().unwrap(),
                reply_to: "10.0.0.9:5555".to_string(),
            })
            .unwrap();

        assert_eq!(
            h.retry_events.recv().await.unwrap(),
            RetryEvent::PerformCleanUp { seq_id: 1 }
        );
        assert_eq!(h.retry.pending_count(), 0);

        let _ = h.shutdown_tx.send(true);
    }

    // -- 4. transport_errors_pass_through ------------------------------------

    #[tokio::test]
    async fn transport_errors_pass_through() {
        let mut h = setup();

        let msg_id = h.retry.send("rp-9", Bytes::from_static(b"outbound"));
        let _ = h.retry_events.recv().await;

        h.inbound_tx
            .send(TransportEvent::Error(TransportError::InvalidAddress {
                addr: "???".to_string(),
                reason: "unresolvable".to_string(),
            }))
            .unwrap();

        assert!(matches!(
            h.recv_events.recv().await.unwrap(),
            RecvEvent::Error(TransportError::InvalidAddress { .. })
        ));
        // Retry state is untouched by the receive-side error.
        assert_eq!(h.retry.pending_count(), 1);
        h.retry.ack_received(msg_id);

        let _ = h.shutdown_tx.send(true);
    }

    // -- 5. shutdown_stops_the_loop ------------------------------------------

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let mut h = setup();

        let _ = h.shutdown_tx.send(true);
        // Once the loop exits, the controller (and our event sender) drop.
        assert!(h.recv_events.recv().await.is_none());
    }
}
