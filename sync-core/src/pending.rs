//! Pending-request table for the RPC channel.
//!
//! This module tracks requests that were sent but have not been answered:
//! - Monotonically increasing correlation ids
//! - Lookup by id when a response arrives (in any order)
//! - Max size limits to prevent unbounded memory growth
//!
//! The table is generic over the reply handle so it stays free of async
//! types; sync-client stores a `oneshot::Sender` in it.

use std::collections::BTreeMap;
use std::time::Instant;

/// Error type for pending-table operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PendingError {
    /// Table is at capacity.
    #[error("too many requests in flight (capacity: {capacity})")]
    Full {
        /// Table capacity.
        capacity: usize,
    },
    /// The id is already in use.
    #[error("duplicate request id {0}")]
    Duplicate(u64),
}

/// A request waiting for its response.
#[derive(Debug)]
pub struct PendingRequest<T> {
    /// Correlation id.
    pub id: u64,
    /// Method the request called.
    pub method: String,
    /// When the request was sent.
    pub issued_at: Instant,
    /// Where the response goes.
    pub reply: T,
}

/// Requests in flight, keyed by correlation id.
///
/// Entries flow through the table in this order:
/// 1. `allocate_id()` - reserve the next id
/// 2. `insert()` - record the request before it is written
/// 3. `complete()` - remove it when the response arrives
///
/// On teardown, `drain()` hands every entry back so each can be rejected.
#[derive(Debug)]
pub struct PendingTable<T> {
    max_size: usize,
    next_id: u64,
    entries: BTreeMap<u64, PendingRequest<T>>,
}

impl<T> PendingTable<T> {
    /// Create a new table with the given maximum size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }

    /// Reserve the next correlation id.
    ///
    /// Ids start at 1 and never repeat for the lifetime of the table, across
    /// reconnects.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Record a request.
    pub fn insert(
        &mut self,
        id: u64,
        method: impl Into<String>,
        reply: T,
    ) -> Result<(), PendingError> {
        if self.entries.len() >= self.max_size {
            return Err(PendingError::Full {
                capacity: self.max_size,
            });
        }
        if self.entries.contains_key(&id) {
            return Err(PendingError::Duplicate(id));
        }
        self.entries.insert(
            id,
            PendingRequest {
                id,
                method: method.into(),
                issued_at: Instant::now(),
                reply,
            },
        );
        Ok(())
    }

    /// Remove and return the request a response belongs to.
    ///
    /// Returns `None` for unknown (or already completed) ids.
    pub fn complete(&mut self, id: u64) -> Option<PendingRequest<T>> {
        self.entries.remove(&id)
    }

    /// Check if a request is pending.
    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> Vec<PendingRequest<T>> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
