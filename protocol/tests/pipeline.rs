//! End-to-end pipeline tests: two nodes wired over an in-memory transport,
//! exercising reliable delivery, height gating, and restart recovery
//! together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use verid_protocol::chain::{
    BlockNotification, BlockSyncTracker, ErrorNotifier, HeightGatedDispatcher, HeightWatermark,
    QueueMessage, RequestProcessor,
};
use verid_protocol::mq::{
    Frame, ReceiveController, RecvEvent, RetryConfig, RetryEngine, RetryEvent, Transport,
    TransportError, TransportEvent,
};
use verid_protocol::storage::VeridDb;

const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// In-Memory Transport
// ---------------------------------------------------------------------------

type Registry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<TransportEvent>>>>;

/// Loopback transport: a shared registry maps addresses to inbound
/// channels. `drop_remaining` makes the next N sends vanish, standing in
/// for datagram loss.
struct MemTransport {
    addr: String,
    registry: Registry,
    drop_remaining: AtomicUsize,
}

impl MemTransport {
    fn bind(registry: &Registry, addr: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.lock().insert(addr.to_string(), tx);
        (
            Arc::new(Self {
                addr: addr.to_string(),
                registry: Arc::clone(registry),
                drop_remaining: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    fn drop_next(&self, n: usize) {
        self.drop_remaining.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn send(&self, addr: &str, bytes: Bytes) -> Result<(), TransportError> {
        if self
            .drop_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(());
        }
        let target = self.registry.lock().get(addr).cloned();
        if let Some(target) = target {
            let _ = target.send(TransportEvent::Incoming {
                bytes,
                reply_to: self.addr.clone(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Node Harness
// ---------------------------------------------------------------------------

struct ChannelProcessor {
    tx: mpsc::UnboundedSender<QueueMessage>,
}

#[async_trait]
impl RequestProcessor for ChannelProcessor {
    async fn process(&self, message: &QueueMessage) -> anyhow::Result<()> {
        let _ = self.tx.send(message.clone());
        Ok(())
    }
}

struct NullNotifier;

#[async_trait]
impl ErrorNotifier for NullNotifier {
    async fn notify(&self, _action: &str, _error: &anyhow::Error, _request_id: Option<&str>) {}
}

/// One fully wired node: retry engine pumping frames onto the transport,
/// receive controller acking and republishing, dispatcher gating on the
/// tracker's watermark.
struct TestNode {
    transport: Arc<MemTransport>,
    retry: RetryEngine,
    tracker: Arc<BlockSyncTracker>,
    processed: mpsc::UnboundedReceiver<QueueMessage>,
    retry_events: mpsc::UnboundedReceiver<RetryEvent>,
    shutdown: watch::Sender<bool>,
}

fn spawn_node(registry: &Registry, addr: &str, db: Arc<VeridDb>) -> TestNode {
    let (transport, inbound) = MemTransport::bind(registry, addr);

    let recovered = BlockSyncTracker::recover_confirmed_height(&db);
    let watermark = HeightWatermark::new(recovered);
    let (processed_tx, processed) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(HeightGatedDispatcher::new(
        Arc::clone(&db),
        watermark.clone(),
        Arc::new(ChannelProcessor { tx: processed_tx }),
        Arc::new(NullNotifier),
    ));
    let tracker = Arc::new(BlockSyncTracker::new(
        db,
        watermark,
        Arc::clone(&dispatcher),
        recovered,
    ));
    tracker.set_ready();

    let config = RetryConfig {
        retry_interval: Duration::from_millis(50),
        total_timeout: Duration::from_secs(30),
    };
    let (retry, engine_events) = RetryEngine::new(config);

    // Tap the retry event stream: perform the sends, forward everything to
    // the test for inspection.
    let (tap_tx, retry_events) = mpsc::unbounded_channel();
    let pump_transport = Arc::clone(&transport);
    let node_id = addr.to_string();
    tokio::spawn(async move {
        let mut engine_events = engine_events;
        while let Some(event) = engine_events.recv().await {
            if let RetryEvent::PerformSend {
                dest,
                payload,
                msg_id,
                seq_id,
            } = &event
            {
                let frame = Frame::data(&node_id, *msg_id, *seq_id, payload);
                if let Ok(bytes) = frame.encode() {
                    let _ = pump_transport.send(dest, bytes).await;
                }
            }
            let _ = tap_tx.send(event);
        }
    });

    let (controller, recv_events) = ReceiveController::new(Arc::clone(&transport), retry.clone());
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        controller.run(inbound, shutdown_rx).await;
    });

    let recv_dispatcher = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        let mut recv_events = recv_events;
        while let Some(event) = recv_events.recv().await {
            if let RecvEvent::Message(inbound) = event {
                if let Ok(message) = serde_json::from_slice::<QueueMessage>(&inbound.payload) {
                    recv_dispatcher.on_message_arrived(message).await;
                }
            }
        }
    });

    TestNode {
        transport,
        retry,
        tracker,
        processed,
        retry_events,
        shutdown,
    }
}

fn msg(request_id: &str, height: u64) -> QueueMessage {
    QueueMessage {
        request_id: request_id.to_string(),
        height,
        body: serde_json::json!({ "op": "create_request" }),
    }
}

fn payload(message: &QueueMessage) -> Bytes {
    Bytes::from(serde_json::to_vec(message).expect("serialize"))
}

async fn next_processed(node: &mut TestNode) -> QueueMessage {
    tokio::time::timeout(WAIT, node.processed.recv())
        .await
        .expect("timed out waiting for processed message")
        .expect("processed stream closed")
}

async fn wait_for_cleanup(node: &mut TestNode) -> u64 {
    loop {
        let event = tokio::time::timeout(WAIT, node.retry_events.recv())
            .await
            .expect("timed out waiting for retry event")
            .expect("retry event stream closed");
        if let RetryEvent::PerformCleanUp { seq_id } = event {
            return seq_id;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// -- 1. delivery_ack_and_dispatch ---------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn delivery_ack_and_dispatch() {
    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
    let db_a = Arc::new(VeridDb::open_temporary().unwrap());
    let db_b = Arc::new(VeridDb::open_temporary().unwrap());
    let mut node_a = spawn_node(&registry, "node-a", db_a);
    let mut node_b = spawn_node(&registry, "node-b", db_b);

    // Height 3 confirmed on the receiver, so the message dispatches on
    // arrival.
    node_b
        .tracker
        .handle_new_block(BlockNotification {
            height: 3,
            app_hash: [1; 32],
        })
        .await;

    let message = msg("req-1", 3);
    node_a.retry.send("node-b", payload(&message));

    let delivered = next_processed(&mut node_b).await;
    assert_eq!(delivered, message);

    // Ack makes it back and clears sender-side state.
    let seq = wait_for_cleanup(&mut node_a).await;
    assert_eq!(seq, 1);
    assert_eq!(node_a.retry.pending_count(), 0);

    let _ = node_a.shutdown.send(true);
    let _ = node_b.shutdown.send(true);
}

// -- 2. retry_covers_lost_datagram --------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn retry_covers_lost_datagram() {
    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
    let db_a = Arc::new(VeridDb::open_temporary().unwrap());
    let db_b = Arc::new(VeridDb::open_temporary().unwrap());
    let mut node_a = spawn_node(&registry, "node-a", db_a);
    let mut node_b = spawn_node(&registry, "node-b", db_b);

    node_b
        .tracker
        .handle_new_block(BlockNotification {
            height: 1,
            app_hash: [1; 32],
        })
        .await;

    // First transmission vanishes; the 50ms retry redelivers it.
    node_a.transport.drop_next(1);
    let message = msg("req-lost", 1);
    node_a.retry.send("node-b", payload(&message));

    let delivered = next_processed(&mut node_b).await;
    assert_eq!(delivered, message);
    wait_for_cleanup(&mut node_a).await;
    assert_eq!(node_a.retry.pending_count(), 0);

    let _ = node_a.shutdown.send(true);
    let _ = node_b.shutdown.send(true);
}

// -- 3. future_height_parks_until_block ---------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn future_height_parks_until_block() {
    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
    let db_a = Arc::new(VeridDb::open_temporary().unwrap());
    let db_b = Arc::new(VeridDb::open_temporary().unwrap());
    let mut node_a = spawn_node(&registry, "node-a", db_a);
    let mut node_b = spawn_node(&registry, "node-b", db_b);

    node_b
        .tracker
        .handle_new_block(BlockNotification {
            height: 10,
            app_hash: [1; 32],
        })
        .await;

    // Sender already saw block 12; the receiver has not.
    let message = msg("req-future", 12);
    node_a.retry.send("node-b", payload(&message));

    // Wire receipt is acked even though dispatch is parked.
    wait_for_cleanup(&mut node_a).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), node_b.processed.recv())
            .await
            .is_err(),
        "message dispatched before its height confirmed"
    );

    // Block 12 arrives (11 was missed); the sweep releases the request.
    node_b
        .tracker
        .handle_new_block(BlockNotification {
            height: 12,
            app_hash: [2; 32],
        })
        .await;
    let delivered = next_processed(&mut node_b).await;
    assert_eq!(delivered, message);

    // Exactly once.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), node_b.processed.recv())
            .await
            .is_err(),
        "parked message released twice"
    );

    let _ = node_a.shutdown.send(true);
    let _ = node_b.shutdown.send(true);
}

// -- 4. parked_request_survives_restart ---------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn parked_request_survives_restart() {
    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
    let dir = tempfile::tempdir().unwrap();

    // First life: confirm height 100, park a request at 101, shut down.
    {
        let db = Arc::new(VeridDb::open(dir.path()).unwrap());
        let db_a = Arc::new(VeridDb::open_temporary().unwrap());
        let mut node_a = spawn_node(&registry, "node-a", db_a);
        let mut node_b = spawn_node(&registry, "node-b-v1", db);

        node_b
            .tracker
            .handle_new_block(BlockNotification {
                height: 100,
                app_hash: [1; 32],
            })
            .await;

        node_a.retry.send("node-b-v1", payload(&msg("req-101", 101)));
        wait_for_cleanup(&mut node_a).await;

        let _ = node_a.shutdown.send(true);
        let _ = node_b.shutdown.send(true);
    }
    registry.lock().clear();

    // Sled holds a file lock until every handle in the spawned tasks has
    // dropped; reopening may briefly fail while they unwind.
    let mut db = None;
    for _ in 0..100 {
        match VeridDb::open(dir.path()) {
            Ok(opened) => {
                db = Some(Arc::new(opened));
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let db = db.expect("database did not unlock after shutdown");

    // Second life: recover height 100 from disk, then block 101 releases
    // the parked request.
    let mut node_b = spawn_node(&registry, "node-b-v2", db);
    assert_eq!(node_b.tracker.confirmed_height(), Some(100));

    node_b
        .tracker
        .handle_new_block(BlockNotification {
            height: 101,
            app_hash: [2; 32],
        })
        .await;
    let delivered = next_processed(&mut node_b).await;
    assert_eq!(delivered.request_id, "req-101");

    let _ = node_b.shutdown.send(true);
}

// -- 5. catch_up_sweep_spans_missed_blocks ------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn catch_up_sweep_spans_missed_blocks() {
    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
    let db_a = Arc::new(VeridDb::open_temporary().unwrap());
    let db_b = Arc::new(VeridDb::open_temporary().unwrap());
    let mut node_a = spawn_node(&registry, "node-a", db_a);
    let mut node_b = spawn_node(&registry, "node-b", db_b);

    node_b
        .tracker
        .handle_new_block(BlockNotification {
            height: 100,
            app_hash: [1; 32],
        })
        .await;

    for (id, height) in [("req-101", 101), ("req-102", 102), ("req-103", 103)] {
        node_a.retry.send("node-b", payload(&msg(id, height)));
        wait_for_cleanup(&mut node_a).await;
    }

    // One notification jumps from 100 to 103; the sweep covers all three
    // gated heights.
    node_b
        .tracker
        .handle_new_block(BlockNotification {
            height: 103,
            app_hash: [2; 32],
        })
        .await;

    let mut released = Vec::new();
    for _ in 0..3 {
        released.push(next_processed(&mut node_b).await.request_id);
    }
    released.sort();
    assert_eq!(released, vec!["req-101", "req-102", "req-103"]);

    let _ = node_a.shutdown.send(true);
    let _ = node_b.shutdown.send(true);
}
