//! # Chain Feed Listener
//!
//! TCP listener for the local chain daemon. The daemon connects and
//! streams newline-delimited JSON events:
//!
//! ```text
//! {"type":"status","catching_up":true}
//! {"type":"status","catching_up":false}
//! {"type":"block","height":1042,"app_hash":"9f3a…"}
//! ```
//!
//! A `status` line with `catching_up: false` marks the node in sync and
//! enables block processing. `block` lines feed the sync tracker.
//! Malformed lines are logged and skipped; the feed must survive a noisy
//! or restarting daemon.

use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use verid_protocol::chain::{BlockNotification, BlockSyncTracker};

/// One line of the chain feed protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedLine {
    Status { catching_up: bool },
    Block { height: u64, app_hash: String },
}

/// Accepts chain daemon connections until shutdown fires.
pub async fn run_feed_listener(
    listener: TcpListener,
    tracker: Arc<BlockSyncTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("chain feed listener shutting down");
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "chain feed connected");
                    let tracker = Arc::clone(&tracker);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, tracker, shutdown).await;
                        info!(%peer, "chain feed disconnected");
                    });
                }
                Err(e) => {
                    warn!(error = %e, "chain feed accept failed");
                }
            }
        }
    }
}

/// Reads one daemon connection line by line until EOF or shutdown.
async fn handle_connection(
    stream: TcpStream,
    tracker: Arc<BlockSyncTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => apply_line(&tracker, &line).await,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "chain feed read error, dropping connection");
                    return;
                }
            }
        }
    }
}

/// Parses and applies a single feed line.
async fn apply_line(tracker: &BlockSyncTracker, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<FeedLine>(line) {
        Ok(FeedLine::Status { catching_up }) => {
            if catching_up {
                debug!("chain daemon still catching up");
            } else {
                tracker.set_ready();
            }
        }
        Ok(FeedLine::Block { height, app_hash }) => match parse_app_hash(&app_hash) {
            Some(app_hash) => {
                tracker
                    .handle_new_block(BlockNotification { height, app_hash })
                    .await;
            }
            None => {
                warn!(height, app_hash = %app_hash, "block event with malformed app hash, skipping");
            }
        },
        Err(e) => {
            warn!(error = %e, line, "unparseable chain feed line, skipping");
        }
    }
}

/// Decodes a 64-hex-character app hash.
fn parse_app_hash(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}
