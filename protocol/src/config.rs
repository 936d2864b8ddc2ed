//! # Protocol Configuration & Constants
//!
//! Every magic number in VERID lives here. These values are shared between
//! the sending and receiving side of the message queue, so changing them
//! after nodes are deployed is a wire-compatibility event — treat them like
//! consensus parameters, not tunables.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire Format
// ---------------------------------------------------------------------------

/// Magic bytes at the start of every message-queue frame. Lets a receiver
/// reject non-VERID traffic before paying for a full decode.
pub const ENVELOPE_MAGIC: u32 = 0x5652_4944; // "VRID"

/// Wire version of the envelope format. Bumped on any change to the frame
/// layout; a receiver only decodes frames whose version it understands.
pub const WIRE_VERSION: u16 = 1;

/// Length of the frame preamble: 4 bytes of magic + 2 bytes of version.
pub const ENVELOPE_PREAMBLE_LEN: usize = 6;

/// Maximum size of a single message-queue frame, preamble included.
/// Identity requests carry signed request bodies and proof references, not
/// bulk data — 2 MiB is generous headroom, and anything larger is either a
/// bug or an attack.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Delivery Timing
// ---------------------------------------------------------------------------

/// How long the retry engine waits between retransmissions of an
/// unacknowledged message.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Total time the retry engine keeps trying before declaring a delivery
/// dead. Long enough to ride out a peer restart, short enough that an
/// operator hears about a genuinely unreachable counterparty the same
/// minute it happens.
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Default Ports
// ---------------------------------------------------------------------------

/// Default UDP port for the message-queue socket.
pub const DEFAULT_MQ_PORT: u16 = 5555;

/// Default TCP port for the chain notification feed.
pub const DEFAULT_CHAIN_FEED_PORT: u16 = 5556;
