//! # Reliable Message Queue
//!
//! Point-to-point message delivery between network participants over an
//! unreliable transport. The guarantee on offer: a message handed to
//! [`retry::RetryEngine::send`] is retransmitted until the receiver
//! acknowledges wire receipt or a total timeout declares the delivery dead —
//! never silently lost in between.
//!
//! The subsystem splits into four pieces:
//!
//! - [`envelope`] — the wire frame pairing a payload with its retry
//!   correlation metadata (message id, sequence id), plus the matching ack
//!   frame. Stateless codec.
//! - [`transport`] — the unreliable byte-shipping seam. A [`transport::Transport`]
//!   implementation only has to move opaque frames; everything above it
//!   assumes frames can be dropped, duplicated, or reordered.
//! - [`retry`] — the per-message retry state machine. Emits side-effect
//!   events; performs no I/O of its own.
//! - [`recv`] — the inbound controller: ack first, republish second, and
//!   route peer acks back into the local retry engine.

pub mod envelope;
pub mod recv;
pub mod retry;
pub mod transport;

pub use envelope::{EnvelopeError, Frame};
pub use recv::{InboundMessage, ReceiveController, RecvEvent};
pub use retry::{MessageId, RetryConfig, RetryEngine, RetryEvent};
pub use transport::{Transport, TransportError, TransportEvent, UdpTransport};
