//! Inbound rate limiting - token bucket per peer.

use std::collections::HashMap;
use std::time::Instant;

use mesh_protocol::NodeId;

/// Simple token bucket rate limiter per sending peer.
pub struct RateLimiter {
    buckets: HashMap<NodeId, TokenBucket>,
    capacity: u32,
    refill_per_sec: f64,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a rate limiter.
    /// - `capacity`: max burst frames
    /// - `refill_per_sec`: steady-state rate (frames per second)
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            buckets: HashMap::new(),
            capacity,
            refill_per_sec,
        }
    }

    /// Returns true if the frame is allowed, false if rate-limited.
    pub fn check(&mut self, peer: &NodeId) -> bool {
        self.check_at(peer, Instant::now())
    }

    pub fn check_at(&mut self, peer: &NodeId, now: Instant) -> bool {
        let capacity = self.capacity as f64;
        let bucket = self
            .buckets
            .entry(peer.clone())
            .or_insert_with(|| TokenBucket {
                tokens: capacity,
                last_refill: now,
            });
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(capacity);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop the bucket of a peer that went away.
    pub fn forget(&mut self, peer: &NodeId) {
        self.buckets.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_limiter_allows_within_capacity() {
        let mut rl = RateLimiter::new(5, 1.0);
        let peer = NodeId::new("node-a");
        for _ in 0..5 {
            assert!(rl.check(&peer), "should allow up to capacity");
        }
    }

    #[test]
    fn test_rate_limiter_blocks_over_capacity() {
        let mut rl = RateLimiter::new(3, 0.0); // refill=0 so no refill
        let peer = NodeId::new("node-a");
        for _ in 0..3 {
            rl.check(&peer);
        }
        assert!(!rl.check(&peer), "should block when over capacity");
    }

    #[test]
    fn test_rate_limiter_separate_buckets() {
        let mut rl = RateLimiter::new(1, 0.0);
        assert!(rl.check(&NodeId::new("node-a")));
        assert!(!rl.check(&NodeId::new("node-a")));
        assert!(rl.check(&NodeId::new("node-b")));
    }

    #[test]
    fn test_rate_limiter_refills() {
        let mut rl = RateLimiter::new(1, 10.0);
        let peer = NodeId::new("node-a");
        let t0 = Instant::now();
        assert!(rl.check_at(&peer, t0));
        assert!(!rl.check_at(&peer, t0));
        assert!(rl.check_at(&peer, t0 + Duration::from_millis(150)));
    }
}
