//! # VeridDb — Persistent Node Storage
//!
//! The persistence layer for a VERID node, built on sled's embedded
//! key-value store.
//!
//! ## Tree Layout
//!
//! | Tree                | Key                            | Value                    |
//! |---------------------|--------------------------------|--------------------------|
//! | `metadata`          | key (UTF-8)                    | value (bytes)            |
//! | `pending_requests`  | `request_id` (UTF-8)           | `bincode(PendingRecord)` |
//! | `pending_by_height` | `height` (8B BE) ++ request_id | `request_id` (UTF-8)     |
//!
//! Heights are stored as big-endian u64 so sled's lexicographic ordering
//! matches numeric ordering — range sweeps over the height index work
//! naturally.
//!
//! The by-height index carries the request id in the key (not only the
//! value) because one height can gate many requests; the composite key
//! keeps every entry distinct while staying inside one scan range.
//!
//! ## Crash behavior
//!
//! A pending put writes the record first and the index entry second. A
//! crash in between leaves a record with no index entry; the record is
//! re-observed through the queue path on redelivery, and the dispatcher's
//! lock set plus idempotent processing make the redundancy harmless. The
//! reverse (index entry without record) is handled by sweeps skipping ids
//! whose record is gone.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt record for key `{0}`")]
    Corrupt(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Metadata Keys
// ---------------------------------------------------------------------------

/// Well-known key in the `metadata` tree for the confirmed block height.
const META_CONFIRMED_HEIGHT: &[u8] = b"confirmed_height";

// ---------------------------------------------------------------------------
// PendingRecord
// ---------------------------------------------------------------------------

/// One parked request: the height gating it and the raw message bytes to
/// replay once the height confirms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    /// Block height the message declared; dispatch waits for it.
    pub height: u64,
    /// The serialized queue message, exactly as it will be re-dispatched.
    pub raw: Vec<u8>,
}

// ---------------------------------------------------------------------------
// VeridDb
// ---------------------------------------------------------------------------

/// Persistent storage for a VERID node.
///
/// sled is inherently thread-safe; `VeridDb` can be shared across tasks via
/// `Arc<VeridDb>` without external synchronization.
#[derive(Debug, Clone)]
pub struct VeridDb {
    #[allow(dead_code)]
    db: Db,
    /// Arbitrary key-value metadata (confirmed height).
    metadata: Tree,
    /// Pending requests by request id.
    pending: Tree,
    /// Height index over pending requests.
    pending_by_height: Tree,
}

impl VeridDb {
    /// Opens or creates a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Creates a temporary database cleaned up on drop. For tests.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let metadata = db.open_tree("metadata")?;
        let pending = db.open_tree("pending_requests")?;
        let pending_by_height = db.open_tree("pending_by_height")?;
        Ok(Self {
            db,
            metadata,
            pending,
            pending_by_height,
        })
    }

    // -- Confirmed height ---------------------------------------------------

    /// Loads the persisted confirmed height. `None` means the node has
    /// never confirmed a block (cold start).
    pub fn load_confirmed_height(&self) -> DbResult<Option<u64>> {
        match self.metadata.get(META_CONFIRMED_HEIGHT)? {
            None => Ok(None),
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_ref()
                    .try_into()
                    .map_err(|_| DbError::Corrupt("confirmed_height".to_string()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
        }
    }

    /// Persists the confirmed height and flushes it to disk.
    ///
    /// The caller treats failures as best-effort (logged, not fatal): the
    /// worst case after a crash is redundant reprocessing, which dispatch
    /// is built to tolerate.
    pub fn save_confirmed_height(&self, height: u64) -> DbResult<()> {
        self.metadata
            .insert(META_CONFIRMED_HEIGHT, &height.to_be_bytes())?;
        self.metadata.flush()?;
        Ok(())
    }

    // -- Pending requests ---------------------------------------------------

    /// Durably parks a request behind its declared height.
    pub fn put_pending(&self, request_id: &str, height: u64, raw: &[u8]) -> DbResult<()> {
        let record = PendingRecord {
            height,
            raw: raw.to_vec(),
        };
        let encoded =
            bincode::serialize(&record).map_err(|e| DbError::Serialization(e.to_string()))?;
        self.pending.insert(request_id.as_bytes(), encoded)?;
        self.pending_by_height
            .insert(height_key(height, request_id), request_id.as_bytes())?;
        self.pending.flush()?;
        Ok(())
    }

    /// Loads a parked request, `None` if absent (already dispatched or
    /// never parked).
    pub fn get_pending(&self, request_id: &str) -> DbResult<Option<PendingRecord>> {
        match self.pending.get(request_id.as_bytes())? {
            None => Ok(None),
            Some(raw) => bincode::deserialize(&raw)
                .map(Some)
                .map_err(|_| DbError::Corrupt(request_id.to_string())),
        }
    }

    /// Removes a parked request record. The height-index entry is left for
    /// sweep garbage collection; sweeps skip ids whose record is gone.
    pub fn delete_pending(&self, request_id: &str) -> DbResult<()> {
        self.pending.remove(request_id.as_bytes())?;
        Ok(())
    }

    /// Request ids parked at heights in `[from, to]` inclusive, in height
    /// order.
    pub fn pending_in_range(&self, from: u64, to: u64) -> DbResult<Vec<String>> {
        let mut ids = Vec::new();
        for item in self.pending_by_height.range(from.to_be_bytes().to_vec()..) {
            let (key, value) = item?;
            if key_height(&key) > to {
                break;
            }
            ids.push(String::from_utf8_lossy(&value).into_owned());
        }
        Ok(ids)
    }

    /// Deletes every height-index entry in `[from, to]` inclusive,
    /// returning how many were removed.
    pub fn delete_pending_range(&self, from: u64, to: u64) -> DbResult<usize> {
        let mut keys = Vec::new();
        for item in self.pending_by_height.range(from.to_be_bytes().to_vec()..) {
            let (key, _) = item?;
            if key_height(&key) > to {
                break;
            }
            keys.push(key);
        }
        for key in &keys {
            self.pending_by_height.remove(key)?;
        }
        Ok(keys.len())
    }

    /// Number of parked request records. For tests and diagnostics.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Composite height-index key: 8-byte big-endian height, then the id.
fn height_key(height: u64, request_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + request_id.len());
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(request_id.as_bytes());
    key
}

/// Height prefix of a composite index key. Short keys sort before any
/// well-formed key and parse as height 0.
fn key_height(key: &[u8]) -> u64 {
    if key.len() < 8 {
        return 0;
    }
    u64::from_be_bytes([
        key[0], key[1], key[2], key[3], key[4], key[5], key[6], key[7],
    ])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
