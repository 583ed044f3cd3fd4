//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    create_burst_limiter(requests_per_second, requests_per_second)
}

/// Create a rate limiter that refills at `requests_per_second` but lets up to
/// `burst` requests through at once
pub fn create_burst_limiter(requests_per_second: u32, burst: u32) -> Arc<Limiter> {
    let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst.max(requests_per_second)).unwrap_or(rate);
    Arc::new(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)))
}

/// Max reliable-channel messages per second accepted from one peer.
/// Inputs are sampled once per local frame, so this leaves room for 120 Hz
/// clients plus control traffic.
pub const PEER_INPUT_RATE_LIMIT: u32 = 150;

/// Inputs a peer may send at once, e.g. a backlog flushed after a stall
pub const PEER_INPUT_BURST: u32 = 2 * PEER_INPUT_RATE_LIMIT;

/// Per-peer inbound rate limiter state. Inputs have their own budget with a
/// burst allowance so other traffic cannot starve them.
#[derive(Clone)]
pub struct PeerRateLimiter {
    input_limiter: Arc<Limiter>,
    message_limiter: Arc<Limiter>,
}

impl PeerRateLimiter {
    pub fn new() -> Self {
        Self::with_limits(PEER_INPUT_RATE_LIMIT, PEER_INPUT_BURST)
    }

    pub fn with_limits(per_second: u32, input_burst: u32) -> Self {
        Self {
            input_limiter: create_burst_limiter(per_second, input_burst),
            message_limiter: create_limiter(per_second),
        }
    }

    /// Check if an inbound input is allowed (returns true if allowed)
    pub fn check_input(&self) -> bool {
        self.input_limiter.check().is_ok()
    }

    /// Check if any other inbound message is allowed
    pub fn check_message(&self) -> bool {
        self.message_limiter.check().is_ok()
    }
}

impl Default for PeerRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
