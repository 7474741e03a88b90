//! Rate limiting: four distinct token-bucket scopes sharing the
//! proportional-refill bucket idiom.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RateLimitConfig {
    pub per_agent_per_min: u32,
    pub contact_requests_per_hour: u32,
    pub registrations_per_hour_per_ip: u32,
    pub global_per_min: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_agent_per_min: 60,
            contact_requests_per_hour: 10,
            registrations_per_hour_per_ip: 3,
            global_per_min: 10_000,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    limit: u32,
    window: Duration,
}

impl TokenBucket {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            tokens: limit as f64,
            last_refill: Instant::now(),
            limit,
            window,
        }
    }

    fn check(&mut self) -> Result<(), u64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let refill = self.limit as f64 * elapsed.as_secs_f64() / self.window.as_secs_f64();
        self.tokens = (self.tokens + refill).min(self.limit as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let secs_to_wait = (deficit * self.window.as_secs_f64() / self.limit as f64).ceil() as u64;
            Err(secs_to_wait.max(1))
        }
    }

    fn remaining(&self) -> u32 {
        self.tokens.floor() as u32
    }
}

struct BucketMap {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    limit: u32,
    window: Duration,
}

impl BucketMap {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    fn check(&self, key: &str) -> Result<u32, (u64, u32)> {
        let mut buckets = self.buckets.lock().expect("rate limit mutex poisoned");
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.limit, self.window));
        match bucket.check() {
            Ok(()) => Ok(bucket.remaining()),
            Err(retry_after) => Err((retry_after, bucket.remaining())),
        }
    }
}

/// Aggregates the relay's four distinct rate-limit scopes, each its own keyed bucket map.
pub struct RelayRateLimiter {
    per_agent: BucketMap,
    contact_requests: BucketMap,
    registrations: BucketMap,
    global: BucketMap,
}

impl RelayRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            per_agent: BucketMap::new(config.per_agent_per_min, Duration::from_secs(60)),
            contact_requests: BucketMap::new(config.contact_requests_per_hour, Duration::from_secs(3600)),
            registrations: BucketMap::new(config.registrations_per_hour_per_ip, Duration::from_secs(3600)),
            global: BucketMap::new(config.global_per_min, Duration::from_secs(60)),
        }
    }

    /// Checks the aggregate circuit breaker, then the per-agent cap.
    pub fn check_authenticated(&self, agent: &str) -> Result<(), crate::errors::RelayError> {
        self.check_global()?;
        self.per_agent
            .check(agent)
            .map(|_| ())
            .map_err(|(retry_after_secs, remaining)| crate::errors::RelayError::RateLimited {
                retry_after_secs,
                remaining,
            })
    }

    pub fn check_contact_request(&self, agent: &str) -> Result<(), crate::errors::RelayError> {
        self.contact_requests
            .check(agent)
            .map(|_| ())
            .map_err(|(retry_after_secs, remaining)| crate::errors::RelayError::RateLimited {
                retry_after_secs,
                remaining,
            })
    }

    pub fn check_registration(&self, ip: &str) -> Result<(), crate::errors::RelayError> {
        self.registrations
            .check(ip)
            .map(|_| ())
            .map_err(|(retry_after_secs, remaining)| crate::errors::RelayError::RateLimited {
                retry_after_secs,
                remaining,
            })
    }

    fn check_global(&self) -> Result<(), crate::errors::RelayError> {
        self.global
            .check("*")
            .map(|_| ())
            .map_err(|(retry_after_secs, remaining)| crate::errors::RelayError::RateLimited {
                retry_after_secs,
                remaining,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_agent_cap_trips_after_limit() {
        let limiter = RelayRateLimiter::new(RateLimitConfig {
            per_agent_per_min: 2,
            ..RateLimitConfig::default()
        });
        assert!(limiter.check_authenticated("alice").is_ok());
        assert!(limiter.check_authenticated("alice").is_ok());
        assert!(limiter.check_authenticated("alice").is_err());
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = RelayRateLimiter::new(RateLimitConfig {
            per_agent_per_min: 1,
            ..RateLimitConfig::default()
        });
        assert!(limiter.check_authenticated("alice").is_ok());
        assert!(limiter.check_authenticated("bob").is_ok());
    }
}
