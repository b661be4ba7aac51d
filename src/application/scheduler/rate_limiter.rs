//! Token bucket rate limiting, one bucket per platform.
//!
//! Owned by the scheduling loop, so no interior locking. Time is passed in
//! so the loop and tests share one clock.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::Platform;

const DEFAULT_REQUESTS_PER_MINUTE: u32 = 20;
const DEFAULT_BURST: u32 = 2;

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    DEFAULT_BURST
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            burst: DEFAULT_BURST,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
    /// Tokens per second.
    rate: f64,
    capacity: f64,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        let capacity = f64::from(config.burst.max(1));
        Self {
            tokens: capacity,
            last_update: now,
            rate: f64::from(config.requests_per_minute.max(1)) / 60.0,
            capacity,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        }
    }
}

pub struct PlatformLimiter {
    buckets: HashMap<Platform, TokenBucket>,
    configs: HashMap<Platform, RateLimitConfig>,
}

impl PlatformLimiter {
    pub fn new(configs: HashMap<Platform, RateLimitConfig>) -> Self {
        Self {
            buckets: HashMap::new(),
            configs,
        }
    }

    fn bucket(&mut self, platform: Platform, now: Instant) -> &mut TokenBucket {
        let configs = &self.configs;
        self.buckets.entry(platform).or_insert_with(|| {
            let config = configs.get(&platform).cloned().unwrap_or_default();
            TokenBucket::new(&config, now)
        })
    }

    pub fn try_acquire(&mut self, platform: Platform, now: Instant) -> bool {
        let ok = self.bucket(platform, now).try_acquire(now);
        if !ok {
            debug!(platform = %platform, "rate limiter: no token available");
        }
        ok
    }

    /// How long until `platform` has a token. Never zero when `try_acquire` just failed.
    pub fn time_until_available(&mut self, platform: Platform, now: Instant) -> Duration {
        self.bucket(platform, now)
            .time_until_available(now)
            .max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rpm: u32, burst: u32) -> PlatformLimiter {
        let mut configs = HashMap::new();
        configs.insert(
            Platform::Yahoo,
            RateLimitConfig {
                requests_per_minute: rpm,
                burst,
            },
        );
        PlatformLimiter::new(configs)
    }

    #[test]
    fn burst_then_blocked() {
        let now = Instant::now();
        let mut l = limiter(60, 3);
        for _ in 0..3 {
            assert!(l.try_acquire(Platform::Yahoo, now));
        }
        assert!(!l.try_acquire(Platform::Yahoo, now));
    }

    #[test]
    fn refills_at_configured_rate() {
        let now = Instant::now();
        let mut l = limiter(60, 1); // one per second
        assert!(l.try_acquire(Platform::Yahoo, now));
        assert!(!l.try_acquire(Platform::Yahoo, now));

        let wait = l.time_until_available(Platform::Yahoo, now);
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_secs(1));

        assert!(l.try_acquire(Platform::Yahoo, now + Duration::from_secs(1)));
    }

    #[test]
    fn platforms_are_isolated() {
        let now = Instant::now();
        let mut l = limiter(1, 1);
        assert!(l.try_acquire(Platform::Yahoo, now));
        assert!(!l.try_acquire(Platform::Yahoo, now));

        // Unconfigured platforms get the default bucket.
        assert!(l.try_acquire(Platform::Mercari, now));
        assert!(l.try_acquire(Platform::Rakuten, now));
    }
}
