//! # Persistent Storage
//!
//! Durable bookkeeping over sled. Two things must survive a restart: the
//! confirmed-height watermark (so a replayed block notification is
//! recognized as already processed) and the pending-request store (so a
//! message gated behind an unconfirmed height is not lost when the process
//! dies before the height lands).

pub mod db;

pub use db::{DbError, DbResult, PendingRecord, VeridDb};
