// common/src/models/challenge.rs
use std::time::{Duration, Instant};

/// Single-use challenge handed out by the backend for one wallet-ownership
/// handshake. The client keeps a transient copy only; once submitted (or
/// expired) a fresh one must be fetched, never reused in place.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Opaque payload the wallet must sign
    pub payload: String,
    /// When the client requested this challenge
    pub issued_at: Instant,
    /// Freshness window
    pub ttl: Duration,
}

impl Challenge {
    pub fn new(payload: String, ttl: Duration) -> Self {
        Self::issued(payload, Instant::now(), ttl)
    }

    pub fn issued(payload: String, issued_at: Instant, ttl: Duration) -> Self {
        Self { payload, issued_at, ttl }
    }

    /// Age of the challenge, measured from the client-side request instant
    pub fn age(&self) -> Duration {
        self.issued_at.elapsed()
    }

    /// Check if the challenge has outlived its freshness window
    pub fn is_expired(&self) -> bool {
        self.age() >= self.ttl
    }
}
