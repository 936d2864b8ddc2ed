//! # Node Runtime
//!
//! Wires the protocol components into a running node: database, block
//! sync tracker, height-gated dispatcher, UDP message queue with reliable
//! delivery, and the chain feed listener.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use verid_protocol::chain::{
    BlockSyncTracker, ErrorNotifier, HeightGatedDispatcher, HeightWatermark, QueueMessage,
    RequestProcessor,
};
use verid_protocol::mq::{
    Frame, ReceiveController, RecvEvent, RetryConfig, RetryEngine, RetryEvent, Transport,
    UdpTransport,
};
use verid_protocol::storage::VeridDb;

use crate::cli::RunArgs;
use crate::feed;

/// Request handler seam. This build logs released requests; a deployment
/// plugs its identity-request business logic in here.
struct LogProcessor;

#[async_trait]
impl RequestProcessor for LogProcessor {
    async fn process(&self, message: &QueueMessage) -> Result<()> {
        info!(
            request_id = %message.request_id,
            height = message.height,
            "request released for processing"
        );
        Ok(())
    }
}

/// Routes dispatch-layer failures into the log stream.
struct LogNotifier;

#[async_trait]
impl ErrorNotifier for LogNotifier {
    async fn notify(&self, action: &str, error: &anyhow::Error, request_id: Option<&str>) {
        error!(
            action,
            request_id = request_id.unwrap_or("-"),
            error = %error,
            "dispatch error"
        );
    }
}

/// Opens the node database under `data_dir/db`, creating the directory
/// tree on first run.
fn open_database(data_dir: &Path) -> Result<Arc<VeridDb>> {
    let db_path = data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = VeridDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    info!(path = %db_path.display(), "database opened");
    Ok(Arc::new(db))
}

/// Runs the node until a shutdown signal arrives.
pub async fn run(args: RunArgs) -> Result<()> {
    let db = open_database(&args.data_dir)?;

    // --- Chain state ---
    let recovered = BlockSyncTracker::recover_confirmed_height(&db);
    let watermark = HeightWatermark::new(recovered);
    let dispatcher = Arc::new(HeightGatedDispatcher::new(
        Arc::clone(&db),
        watermark.clone(),
        Arc::new(LogProcessor),
        Arc::new(LogNotifier),
    ));
    let tracker = Arc::new(BlockSyncTracker::new(
        Arc::clone(&db),
        watermark,
        Arc::clone(&dispatcher),
        recovered,
    ));

    // --- Message queue transport ---
    let transport = Arc::new(
        UdpTransport::bind(&args.mq_listen)
            .await
            .with_context(|| format!("failed to bind message queue on {}", args.mq_listen))?,
    );
    info!(
        addr = %transport.local_addr().context("message queue socket has no local address")?,
        "message queue listening"
    );
    let (inbound, _receiver_task) = transport.spawn_receiver();

    // --- Reliable delivery ---
    let retry_config = RetryConfig {
        retry_interval: Duration::from_millis(args.retry_interval_ms),
        total_timeout: Duration::from_millis(args.total_timeout_ms),
    };
    let (retry, mut retry_events) = RetryEngine::new(retry_config);

    let node_id = args.node_id.clone();
    let send_transport = Arc::clone(&transport);
    tokio::spawn(async move {
        while let Some(event) = retry_events.recv().await {
            match event {
                RetryEvent::PerformSend {
                    dest,
                    payload,
                    msg_id,
                    seq_id,
                } => {
                    let frame = Frame::data(&node_id, msg_id, seq_id, &payload);
                    match frame.encode() {
                        Ok(bytes) => {
                            if let Err(e) = send_transport.send(&dest, bytes).await {
                                warn!(dest = %dest, %msg_id, error = %e, "send failed, retry pending");
                            }
                        }
                        Err(e) => {
                            error!(%msg_id, error = %e, "failed to encode outbound frame");
                        }
                    }
                }
                RetryEvent::PerformCleanUp { seq_id } => {
                    debug!(seq_id, "delivery confirmed");
                }
                RetryEvent::PerformTotalTimeout { msg_id, dest } => {
                    warn!(%msg_id, dest = %dest, "delivery abandoned after total timeout");
                }
            }
        }
    });

    // --- Inbound pipeline ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (controller, mut recv_events) =
        ReceiveController::new(Arc::clone(&transport), retry.clone());
    let controller_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        controller.run(inbound, controller_shutdown).await;
    });

    let recv_dispatcher = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        while let Some(event) = recv_events.recv().await {
            match event {
                RecvEvent::Message(inbound) => {
                    match serde_json::from_slice::<QueueMessage>(&inbound.payload) {
                        Ok(message) => recv_dispatcher.on_message_arrived(message).await,
                        Err(e) => {
                            warn!(
                                sender = %inbound.sender_id,
                                msg_id = %inbound.msg_id,
                                error = %e,
                                "dropping message with unparseable payload"
                            );
                        }
                    }
                }
                RecvEvent::Error(e) => {
                    warn!(error = %e, "transport receive error");
                }
            }
        }
    });

    // --- Chain feed ---
    let feed_listener = TcpListener::bind(&args.chain_feed_listen)
        .await
        .with_context(|| {
            format!("failed to bind chain feed on {}", args.chain_feed_listen)
        })?;
    info!(addr = %args.chain_feed_listen, "chain feed listening");
    tokio::spawn(feed::run_feed_listener(
        feed_listener,
        Arc::clone(&tracker),
        shutdown_rx,
    ));

    info!(node_id = %args.node_id, "verid-node started");

    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    retry.close();
    info!("verid-node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_database_creates_directory_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a").join("b");

        let db = open_database(&nested).expect("open");
        assert!(nested.join("db").is_dir());
        assert_eq!(db.load_confirmed_height().unwrap(), None);
    }
}
