//! # Envelope Codec
//!
//! The wire frame for the VERID message queue. A frame is a fixed preamble
//! (4-byte magic, 2-byte wire version, both big-endian) followed by a
//! bincode-encoded [`Frame`] body. Two frame types exist:
//!
//! - `Data` — a payload plus the retry correlation metadata (sender id,
//!   message id, sequence id) the receiver needs to ack it and to detect
//!   duplicates or gaps per sender.
//! - `Ack` — the correlation fields alone. Acknowledges *wire receipt*,
//!   nothing more; whether the application later chokes on the payload is
//!   not the sender's delivery problem.
//!
//! The codec is stateless. Sequence-id assignment lives in the retry
//! engine; deduplication lives with the receiver.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ENVELOPE_MAGIC, ENVELOPE_PREAMBLE_LEN, MAX_FRAME_SIZE, WIRE_VERSION};

use super::retry::MessageId;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors produced while encoding or decoding an envelope frame.
///
/// A decode error means the bytes are dropped and logged — no ack is sent
/// for a frame the receiver could not parse.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Fewer bytes than the fixed preamble. Not even worth a magic check.
    #[error("frame truncated: {len} bytes, need at least {min}", min = ENVELOPE_PREAMBLE_LEN)]
    Truncated { len: usize },

    /// The first four bytes are not the VERID magic. Foreign traffic.
    #[error("bad frame magic: {found:#010x}")]
    BadMagic { found: u32 },

    /// The frame declares a wire version this build does not speak.
    #[error("unsupported wire version {found} (expected {expected})", expected = WIRE_VERSION)]
    UnsupportedVersion { found: u16 },

    /// The frame would exceed the transport frame limit.
    #[error("frame of {size} bytes exceeds the {limit} byte limit", limit = MAX_FRAME_SIZE)]
    OversizedFrame { size: usize },

    /// The body did not decode as a known frame type.
    #[error("malformed frame body: {0}")]
    Decode(#[source] bincode::Error),

    /// Serialization of the body failed. Effectively unreachable for the
    /// types involved, but bincode's signature says otherwise.
    #[error("cannot encode frame body: {0}")]
    Encode(#[source] bincode::Error),
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A single message-queue wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// A data message: opaque payload plus retry correlation metadata.
    Data {
        /// Node id of the sender, carried so the receiver can republish
        /// "who said this" to the application without a reverse lookup.
        sender_id: String,
        /// Unique per logical send call. The ack echoes it back.
        msg_id: MessageId,
        /// Monotonically increasing per (sender, destination) pair.
        /// Receivers use it to spot duplicates and gaps.
        seq_id: u64,
        /// The application payload. Opaque at this layer.
        payload: Vec<u8>,
    },

    /// An acknowledgment: correlation fields only, no payload.
    Ack {
        /// Message id being acknowledged.
        msg_id: MessageId,
        /// Sequence id being acknowledged.
        seq_id: u64,
    },
}

impl Frame {
    /// Builds a data frame.
    pub fn data(sender_id: &str, msg_id: MessageId, seq_id: u64, payload: &[u8]) -> Self {
        Frame::Data {
            sender_id: sender_id.to_string(),
            msg_id,
            seq_id,
            payload: payload.to_vec(),
        }
    }

    /// Builds the ack frame correlated with this frame.
    ///
    /// For a `Data` frame this is the ack a receiver sends back. Calling it
    /// on an `Ack` returns an identical ack — harmless, but pointless.
    pub fn ack_for(&self) -> Frame {
        match self {
            Frame::Data { msg_id, seq_id, .. } | Frame::Ack { msg_id, seq_id } => Frame::Ack {
                msg_id: *msg_id,
                seq_id: *seq_id,
            },
        }
    }

    /// Serializes the frame: preamble followed by the bincode body.
    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        let body = bincode::serialize(self).map_err(EnvelopeError::Encode)?;
        let size = ENVELOPE_PREAMBLE_LEN + body.len();
        if size > MAX_FRAME_SIZE {
            return Err(EnvelopeError::OversizedFrame { size });
        }
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&ENVELOPE_MAGIC.to_be_bytes());
        buf.extend_from_slice(&WIRE_VERSION.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf.into())
    }

    /// Parses a frame, validating the preamble before touching the body.
    pub fn decode(bytes: &[u8]) -> Result<Frame, EnvelopeError> {
        if bytes.len() < ENVELOPE_PREAMBLE_LEN {
            return Err(EnvelopeError::Truncated { len: bytes.len() });
        }
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(EnvelopeError::OversizedFrame { size: bytes.len() });
        }
        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != ENVELOPE_MAGIC {
            return Err(EnvelopeError::BadMagic { found: magic });
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != WIRE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion { found: version });
        }
        bincode::deserialize(&bytes[ENVELOPE_PREAMBLE_LEN..]).map_err(EnvelopeError::Decode)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
