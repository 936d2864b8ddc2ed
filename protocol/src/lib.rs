// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # VERID Protocol — Core Library
//!
//! VERID is a permissioned identity-verification network: relying parties,
//! identity providers, and service providers exchange signed request and
//! response messages over a custom message queue, while a Tendermint-style
//! blockchain provides ordering and tamper-evidence for the same requests.
//!
//! This crate implements the part that has to be *correct* when the network
//! is not being polite: delivery over a lossy transport, and dispatch that
//! stays exactly-once while two independent event sources (the queue socket
//! and the block stream) race each other.
//!
//! ## Architecture
//!
//! - **mq** — Reliable message delivery: envelope codec, transport seam,
//!   retry engine, and the receive controller that acks everything it can
//!   decode.
//! - **chain** — Blockchain gating: the block sync tracker that follows the
//!   confirmed-height watermark across gaps, duplicates, and restarts, and
//!   the height-gated dispatcher that holds early messages until their
//!   height lands.
//! - **storage** — Durable bookkeeping over sled: the confirmed height and
//!   the pending-request store that survives a crash mid-gate.
//! - **config** — Protocol constants and default tunables.
//!
//! Cryptography, the blockchain's own RPC encoding, and business request
//! flows are external collaborators — this crate talks to them through
//! narrow traits and never reaches around them.

pub mod chain;
pub mod config;
pub mod mq;
pub mod storage;
