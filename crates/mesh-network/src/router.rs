//! Message router.
//!
//! Inbound frames pass through, in order: the per-peer rate limit, envelope
//! decoding, the TTL check, duplicate suppression and the target check.
//! Surviving envelopes are delivered locally; broadcasts whose remaining
//! hop budget allows it are also handed back for re-flooding.
//!
//! TTL semantics: an envelope is transmitted only with `ttl >= 1`. A
//! receiver drops anything arriving with `ttl == 0`, delivers the rest and
//! forwards a copy with `ttl - 1` and `hop + 1` only while that copy still
//! has `ttl >= 1`. A broadcast created with `ttl == 0` never leaves the node.

use serde::Serialize;

use mesh_protocol::{Envelope, MessageBody, MessageId, NodeId, SeenWindow};

use crate::rate_limit::RateLimiter;
use crate::registry::PeerRegistry;
use crate::NetworkError;

/// Why an inbound frame was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    RateLimited,
    Malformed,
    TtlExpired,
    Duplicate,
    /// A targeted envelope for some other node.
    Misaddressed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Malformed => "malformed",
            Self::TtlExpired => "ttl_expired",
            Self::Duplicate => "duplicate",
            Self::Misaddressed => "misaddressed",
        }
    }
}

/// Outcome of routing one inbound frame.
#[derive(Debug)]
pub enum RouteDecision {
    Deliver {
        envelope: Envelope,
        /// Copy to re-flood, if the hop budget allows.
        forward: Option<Envelope>,
    },
    Drop(DropReason),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub received: u64,
    pub delivered: u64,
    pub sent: u64,
    pub forwarded: u64,
    pub dropped_rate_limited: u64,
    pub dropped_malformed: u64,
    pub dropped_ttl: u64,
    pub dropped_duplicate: u64,
    pub dropped_misaddressed: u64,
    pub send_failures: u64,
}

impl RouterStats {
    fn count_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::RateLimited => self.dropped_rate_limited += 1,
            DropReason::Malformed => self.dropped_malformed += 1,
            DropReason::TtlExpired => self.dropped_ttl += 1,
            DropReason::Duplicate => self.dropped_duplicate += 1,
            DropReason::Misaddressed => self.dropped_misaddressed += 1,
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_rate_limited
            + self.dropped_malformed
            + self.dropped_ttl
            + self.dropped_duplicate
            + self.dropped_misaddressed
    }
}

/// Result of flooding one envelope.
#[derive(Debug, Default)]
pub struct FloodReport {
    pub reached: usize,
    /// Peers whose channel refused the frame.
    pub failed: Vec<(NodeId, NetworkError)>,
}

pub struct MessageRouter {
    local: NodeId,
    seen: SeenWindow<MessageId>,
    limiter: RateLimiter,
    stats: RouterStats,
}

impl MessageRouter {
    pub fn new(local: NodeId, dedup_capacity: usize, limiter: RateLimiter) -> Self {
        Self {
            local,
            seen: SeenWindow::new(dedup_capacity),
            limiter,
            stats: RouterStats::default(),
        }
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Build a broadcast envelope. Returns `None` for `ttl == 0`, which is
    /// never transmitted.
    pub fn prepare_broadcast(&mut self, body: MessageBody, ttl: u32) -> Option<Envelope> {
        if ttl == 0 {
            self.stats.count_drop(DropReason::TtlExpired);
            tracing::debug!("Broadcast with ttl 0 not transmitted");
            return None;
        }
        let envelope = Envelope::broadcast(self.local.clone(), ttl, body);
        // Our own broadcast echoing back is a duplicate.
        self.seen.insert(envelope.message_id.clone());
        Some(envelope)
    }

    /// Build an envelope for exactly one directly connected peer.
    pub fn prepare_direct(&mut self, target: NodeId, body: MessageBody) -> Envelope {
        let envelope = Envelope::direct(self.local.clone(), target, body);
        self.seen.insert(envelope.message_id.clone());
        envelope
    }

    /// Route one inbound frame received from `from`.
    pub fn receive(&mut self, from: &NodeId, data: &[u8]) -> RouteDecision {
        self.stats.received += 1;
        let decision = self.route(from, data);
        match &decision {
            RouteDecision::Deliver { forward, .. } => {
                self.stats.delivered += 1;
                if forward.is_some() {
                    self.stats.forwarded += 1;
                }
            }
            RouteDecision::Drop(reason) => {
                self.stats.count_drop(*reason);
                tracing::debug!(peer = %from, reason = reason.as_str(), "Dropped inbound frame");
            }
        }
        decision
    }

    fn route(&mut self, from: &NodeId, data: &[u8]) -> RouteDecision {
        if !self.limiter.check(from) {
            return RouteDecision::Drop(DropReason::RateLimited);
        }
        let envelope = match Envelope::decode(data) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "Malformed envelope");
                return RouteDecision::Drop(DropReason::Malformed);
            }
        };
        if envelope.ttl == 0 {
            return RouteDecision::Drop(DropReason::TtlExpired);
        }
        if !self.seen.insert(envelope.message_id.clone()) {
            return RouteDecision::Drop(DropReason::Duplicate);
        }
        if let Some(target) = &envelope.target {
            if target != &self.local {
                return RouteDecision::Drop(DropReason::Misaddressed);
            }
            return RouteDecision::Deliver {
                envelope,
                forward: None,
            };
        }

        let forward = (envelope.ttl > 1).then(|| {
            let mut copy = envelope.clone();
            copy.ttl -= 1;
            copy.hop += 1;
            copy
        });
        RouteDecision::Deliver { envelope, forward }
    }

    /// Send `envelope` to every connected peer except `except` and the
    /// envelope's origin. Peers that could not be sent to are reported
    /// back for the caller to close.
    pub fn flood(
        &mut self,
        registry: &PeerRegistry,
        envelope: &Envelope,
        except: Option<&NodeId>,
    ) -> Result<FloodReport, NetworkError> {
        let frame = envelope.encode()?;
        let mut report = FloodReport::default();
        for peer in registry.connected_peers() {
            if Some(&peer) == except || peer == envelope.origin {
                continue;
            }
            match registry.send_to(&peer, frame.clone()) {
                Ok(()) => {
                    report.reached += 1;
                    self.stats.sent += 1;
                }
                Err(e) => {
                    self.stats.send_failures += 1;
                    tracing::warn!(peer = %peer, error = %e, "Failed to flood envelope");
                    report.failed.push((peer, e));
                }
            }
        }
        Ok(report)
    }

    /// Send a targeted envelope. Fails if the target is not `Connected`.
    pub fn send_direct(&mut self, registry: &PeerRegistry, envelope: &Envelope) -> Result<(), NetworkError> {
        let target = envelope
            .target
            .clone()
            .unwrap_or_else(|| self.local.clone());
        let frame = envelope.encode()?;
        match registry.send_to(&target, frame) {
            Ok(()) => {
                self.stats.sent += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.send_failures += 1;
                Err(e)
            }
        }
    }

    /// Forget the rate-limit bucket of a departed peer.
    pub fn forget_peer(&mut self, peer: &NodeId) {
        self.limiter.forget(peer);
    }
}
