use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use crate::ProtocolError;

pub const REPLAY_WINDOW_SECS: u64 = 600; // 10-minute nonce window
pub const TIMESTAMP_TOLERANCE_SECS: u64 = 300; // 5 minutes tolerance

/// Rolling nonce window for signed handshakes.
/// Rejects stale timestamps and any nonce seen inside the window.
pub struct ReplayWindow {
    /// nonce → insertion_timestamp
    seen: HashMap<String, u64>,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }

    /// Check a handshake nonce against the wall clock.
    pub fn check_and_insert(&mut self, nonce: &str, timestamp: u64) -> Result<(), ProtocolError> {
        let now = crate::crypto::current_timestamp_secs();
        self.check_and_insert_at(nonce, timestamp, now)
    }

    /// Same as [`check_and_insert`](Self::check_and_insert) with an explicit clock.
    pub fn check_and_insert_at(
        &mut self,
        nonce: &str,
        timestamp: u64,
        now: u64,
    ) -> Result<(), ProtocolError> {
        self.seen
            .retain(|_, ts| now.saturating_sub(*ts) < REPLAY_WINDOW_SECS);

        let diff = now.abs_diff(timestamp);
        if diff > TIMESTAMP_TOLERANCE_SECS {
            return Err(ProtocolError::Crypto(format!(
                "timestamp {diff}s outside {TIMESTAMP_TOLERANCE_SECS}s tolerance"
            )));
        }

        if self.seen.contains_key(nonce) {
            return Err(ProtocolError::Crypto(format!(
                "replay detected for nonce '{nonce}'"
            )));
        }

        self.seen.insert(nonce.to_string(), now);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.seen.len()
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded set of recently seen ids with FIFO eviction.
///
/// Used for envelope dedup in the router and for idempotent application of
/// coordination messages. Once `capacity` ids are held, inserting a new id
/// evicts the oldest one.
pub struct SeenWindow<K> {
    capacity: usize,
    order: VecDeque<K>,
    members: HashSet<K>,
}

impl<K: Eq + Hash + Clone> SeenWindow<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: K) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        self.push(id);
        true
    }

    /// Record `id` and return the id evicted to make room for it, if any.
    /// Pushing an id already present changes nothing.
    pub fn push(&mut self, id: K) -> Option<K> {
        if self.members.contains(&id) {
            return None;
        }
        let evicted = if self.order.len() == self.capacity {
            self.order.pop_front()
        } else {
            None
        };
        if let Some(oldest) = &evicted {
            self.members.remove(oldest);
        }
        self.order.push_back(id.clone());
        self.members.insert(id);
        evicted
    }

    pub fn contains(&self, id: &K) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
