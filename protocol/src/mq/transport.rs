//! # Transport Seam
//!
//! The message queue assumes an *unreliable* byte-shipping layer: frames may
//! be dropped, duplicated, or reordered, and the retry engine above is what
//! turns that into reliable delivery. This module defines the seam — the
//! [`Transport`] trait plus the inbound [`TransportEvent`] stream — and ships
//! one production implementation over UDP.
//!
//! Addresses are opaque `host:port` strings. In VERID a participant's
//! message-queue address is registered on chain next to its node id, so the
//! destination id the application speaks and the routing token the transport
//! needs are the same string by the time a send reaches this layer.
//!
//! Transport-level receive errors are reported on the event stream and never
//! touch retry/ack bookkeeping — delivery state is governed purely by
//! whether an ack round-trips.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::MAX_FRAME_SIZE;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An outbound frame exceeds what a single datagram can carry.
    #[error("frame of {size} bytes exceeds the {limit} byte transport limit")]
    FrameTooLarge { size: usize, limit: usize },

    /// The address string did not resolve to a usable peer.
    #[error("invalid peer address `{addr}`: {reason}")]
    InvalidAddress { addr: String, reason: String },
}

// ---------------------------------------------------------------------------
// Inbound Events
// ---------------------------------------------------------------------------

/// One event on the inbound side of a transport binding.
#[derive(Debug)]
pub enum TransportEvent {
    /// A frame arrived. `reply_to` is the routing token for answering the
    /// sender over the same binding (used for acks).
    Incoming { bytes: Bytes, reply_to: String },

    /// The transport hit a receive-side error. Reported upward untouched;
    /// the binding keeps running.
    Error(TransportError),
}

// ---------------------------------------------------------------------------
// Transport Trait
// ---------------------------------------------------------------------------

/// Fire-and-forget frame delivery to a remote address.
///
/// Implementations make no delivery promises — the retry engine owns
/// reliability. `send` returning `Ok` means the frame left this process,
/// nothing more.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Ship one frame to `addr`.
    async fn send(&self, addr: &str, bytes: Bytes) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

/// Production transport over a single UDP socket.
///
/// One socket serves both directions: outbound frames (data and acks) are
/// sent from it, and the receiver loop started by [`spawn_receiver`]
/// publishes everything that arrives on it. UDP's properties match the
/// seam's contract exactly — datagrams are already unreliable, unordered,
/// and duplicable, which is precisely what the layers above are built for.
///
/// [`spawn_receiver`]: UdpTransport::spawn_receiver
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Binds the message-queue socket on the given local address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        debug!(local = %socket.local_addr()?, "message queue socket bound");
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Starts the receive loop.
    ///
    /// Returns the inbound event stream plus the loop's task handle so the
    /// node runtime can abort it at shutdown. The loop never exits on its
    /// own: receive errors are published as [`TransportEvent::Error`] and
    /// the loop keeps listening.
    pub fn spawn_receiver(&self) -> (mpsc::UnboundedReceiver<TransportEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Arc::clone(&self.socket);

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, peer)) => {
                        let event = TransportEvent::Incoming {
                            bytes: Bytes::copy_from_slice(&buf[..len]),
                            reply_to: peer.to_string(),
                        };
                        if tx.send(event).is_err() {
                            // Receiver side dropped; nothing left to feed.
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "message queue receive error");
                        if tx.send(TransportEvent::Error(e.into())).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        (rx, handle)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, addr: &str, bytes: Bytes) -> Result<(), TransportError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: bytes.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        let sent = self.socket.send_to(&bytes, addr).await?;
        if sent != bytes.len() {
            return Err(TransportError::InvalidAddress {
                addr: addr.to_string(),
                reason: format!("short write: {} of {} bytes", sent, bytes.len()),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
