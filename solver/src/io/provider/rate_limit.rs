//! Per-provider request admission shared by all sessions.
//!
//! Each provider id gets one token bucket. Waiters queue on a FIFO async mutex
//! before touching the bucket, so admission order is arrival order and no
//! session can be starved by others polling the bucket.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::{debug, instrument};

use crate::io::config::RateLimitConfig;

pub struct ProviderLimiter {
    turn: tokio::sync::Mutex<()>,
    bucket: DefaultDirectRateLimiter,
}

impl ProviderLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        Self {
            turn: tokio::sync::Mutex::new(()),
            bucket: RateLimiter::direct(Quota::per_minute(per_minute).allow_burst(burst)),
        }
    }

    /// Wait for this caller's turn, then for a token.
    pub async fn admit(&self) {
        let _turn = self.turn.lock().await;
        self.bucket.until_ready().await;
    }
}

/// Lazily created limiters keyed by provider id.
pub struct RateLimiterRegistry {
    config: RateLimitConfig,
    limiters: Mutex<HashMap<String, Arc<ProviderLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self))]
    pub fn limiter_for(&self, provider_id: &str) -> Arc<ProviderLimiter> {
        let mut limiters = self
            .limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        limiters
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                debug!(
                    requests_per_minute = self.config.requests_per_minute,
                    burst = self.config.burst,
                    "creating rate limiter"
                );
                Arc::new(ProviderLimiter::new(&self.config))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn registry_shares_limiter_per_provider() {
        let registry = RateLimiterRegistry::new(RateLimitConfig::default());
        let a = registry.limiter_for("deepseek");
        let b = registry.limiter_for("deepseek");
        let c = registry.limiter_for("anthropic");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn burst_is_admitted_immediately() {
        let limiter = ProviderLimiter::new(&RateLimitConfig {
            requests_per_minute: 60,
            burst: 3,
        });
        let started = Instant::now();
        for _ in 0..3 {
            limiter.admit().await;
        }
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn concurrent_waiters_are_all_admitted() {
        let limiter = Arc::new(ProviderLimiter::new(&RateLimitConfig {
            requests_per_minute: 6_000,
            burst: 1,
        }));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.admit().await }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
    }
}
