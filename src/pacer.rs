//! Request pacer for the upstream requests-per-second budget.
//!
//! A token bucket (`governor`) owned by whoever shares the budget. Collectors
//! that hit the same upstream share one `Arc<Pacer>`; each gets its own when
//! the budgets are independent.

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Token-bucket pacer.
pub struct Pacer {
    limiter: Option<DirectLimiter>,
    requests_per_second: u32,
}

impl std::fmt::Debug for Pacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pacer")
            .field("requests_per_second", &self.requests_per_second)
            .field("limited", &self.limiter.is_some())
            .finish()
    }
}

impl Pacer {
    /// Paces to `requests_per_second` with bursts of at most `burst` requests.
    ///
    /// A zero rate is treated as one request per second rather than a halt.
    pub fn per_second(requests_per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: Some(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))),
            requests_per_second: rate.get(),
        }
    }

    /// No pacing at all.
    pub fn unlimited() -> Self {
        Self {
            limiter: None,
            requests_per_second: u32::MAX,
        }
    }

    /// Waits until one more request fits the budget.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    pub fn requests_per_second(&self) -> u32 {
        self.requests_per_second
    }
}
