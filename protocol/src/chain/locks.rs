//! # Request Lock Set
//!
//! Both intake paths — the queue socket and the block catch-up sweep — can
//! observe the same request, and each would happily process it. The lock
//! set is the dedup point: whoever acquires a request id first processes
//! it; everyone else drops their copy on the floor. Dropped, not queued —
//! a concurrent arrival is by construction the same request seen through
//! the other path, and the holder will either serve it or fail it
//! terminally.
//!
//! Guards release on drop, so a lock cannot leak past a panic, an early
//! return, or a processing failure.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// The set of request ids currently being processed.
///
/// Owned by the dispatcher instance — not a process-global — so multiple
/// independent nodes can coexist in one process (the integration tests run
/// two).
#[derive(Debug, Default)]
pub struct RequestLockSet {
    held: DashMap<String, ()>,
}

impl RequestLockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take the lock for `request_id`.
    ///
    /// Returns `None` if another holder is processing the same request.
    /// The check-and-insert is atomic, so two racing callers can never
    /// both succeed.
    pub fn try_acquire(&self, request_id: &str) -> Option<RequestLockGuard<'_>> {
        match self.held.entry(request_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(RequestLockGuard {
                    set: self,
                    request_id: request_id.to_string(),
                })
            }
        }
    }

    /// Whether the request id is currently locked.
    pub fn is_held(&self, request_id: &str) -> bool {
        self.held.contains_key(request_id)
    }

    /// Number of requests currently locked.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Holds the lock for one request id; releases it on drop.
#[derive(Debug)]
pub struct RequestLockGuard<'a> {
    set: &'a RequestLockSet,
    request_id: String,
}

impl RequestLockGuard<'_> {
    /// The locked request id.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for RequestLockGuard<'_> {
    fn drop(&mut self) {
        self.set.held.remove(&self.request_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
