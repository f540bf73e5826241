//! Per-client request throttling
//!
//! Uses the governor crate for efficient, lock-free rate limiting.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use tracing::{debug, warn};

use crate::config::ThrottleConfig;
use crate::error::{RelayError, Result};

type DirectLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug)]
struct ClientLimiter {
    limiter: Arc<DirectLimiter>,
    last_seen_ms: AtomicU64,
}

impl ClientLimiter {
    fn new(limiter: Arc<DirectLimiter>, now_ms: u64) -> Self {
        Self {
            limiter,
            last_seen_ms: AtomicU64::new(now_ms),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

/// Token-bucket throttle keyed by client identity
pub struct ClientThrottle {
    /// Token buckets per client key
    limiters: Arc<DashMap<String, ClientLimiter>>,
    /// Keys that are never throttled
    exempt: Arc<HashSet<String>>,
    /// Requests per second limit
    requests_per_second: NonZeroU32,
    /// Burst size
    burst_size: NonZeroU32,
    /// How long to keep per-client state without activity
    max_idle: Duration,
}

impl ClientThrottle {
    pub fn new(requests_per_second: u32, burst_size: u32, exempt: Vec<String>) -> Self {
        Self {
            limiters: Arc::new(DashMap::new()),
            exempt: Arc::new(exempt.into_iter().collect()),
            requests_per_second: non_zero(requests_per_second),
            burst_size: non_zero(burst_size),
            max_idle: Duration::from_secs(10 * 60),
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(config.rate_per_second, config.burst, config.exempt.clone())
    }

    /// Override how long an idle client's bucket is kept
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Admit one request from `client_key`, or report how long to back off
    pub fn check(&self, client_key: &str) -> Result<()> {
        if self.exempt.contains(client_key) {
            return Ok(());
        }

        let limiter = self.get_or_create_limiter(client_key);

        match limiter.check() {
            Ok(_) => {
                debug!(client = %client_key, "Throttle check passed");
                Ok(())
            }
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                let retry_after_ms = (wait.as_millis() as u64).max(1);
                warn!(client = %client_key, retry_after_ms, "Client throttled");
                Err(RelayError::RateLimited { retry_after_ms })
            }
        }
    }

    fn get_or_create_limiter(&self, client_key: &str) -> Arc<DirectLimiter> {
        let now_ms = now_ms();
        let entry = self
            .limiters
            .entry(client_key.to_string())
            .or_insert_with(|| {
                let quota =
                    Quota::per_second(self.requests_per_second).allow_burst(self.burst_size);
                ClientLimiter::new(Arc::new(GovRateLimiter::direct(quota)), now_ms)
            });

        entry.last_seen_ms.store(now_ms, Ordering::Relaxed);
        entry.limiter.clone()
    }

    /// Drop buckets of clients idle for longer than `max_idle`
    pub fn cleanup(&self) -> usize {
        let now_ms = now_ms();
        let max_idle_ms = self.max_idle.as_millis() as u64;
        let before = self.limiters.len();

        self.limiters.retain(|_, entry| {
            let last_seen = entry.last_seen_ms.load(Ordering::Relaxed);
            now_ms.saturating_sub(last_seen) <= max_idle_ms
        });

        before.saturating_sub(self.limiters.len())
    }

    /// Get the number of tracked clients
    pub fn client_count(&self) -> usize {
        self.limiters.len()
    }
}

impl Clone for ClientThrottle {
    fn clone(&self) -> Self {
        Self {
            limiters: Arc::clone(&self.limiters),
            exempt: Arc::clone(&self.exempt),
            requests_per_second: self.requests_per_second,
            burst_size: self.burst_size,
            max_idle: self.max_idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_throttle_allows_within_burst() {
        let throttle = ClientThrottle::new(3, 10, vec![]);

        for i in 0..10 {
            assert_ok!(throttle.check("192.168.1.1"), "Failed on request {}", i);
        }
    }

    #[test]
    fn test_throttle_blocks_over_burst_with_retry_hint() {
        let throttle = ClientThrottle::new(1, 2, vec![]);

        assert!(throttle.check("192.168.1.1").is_ok());
        assert!(throttle.check("192.168.1.1").is_ok());

        match throttle.check("192.168.1.1") {
            Err(RelayError::RateLimited { retry_after_ms }) => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 1000, "{}", retry_after_ms)
            }
            other => panic!("expected throttling, got {:?}", other),
        }
    }

    #[test]
    fn test_throttle_is_per_client() {
        let throttle = ClientThrottle::new(1, 1, vec![]);

        assert_ok!(throttle.check("192.168.1.1"));
        assert_ok!(throttle.check("192.168.1.2"));
        assert_ok!(throttle.check("192.168.1.3"));

        assert!(matches!(
            throttle.check("192.168.1.1"),
            Err(RelayError::RateLimited { .. })
        ));
        assert_eq!(throttle.client_count(), 3);
    }

    #[test]
    fn test_exempt_clients_are_never_throttled() {
        let throttle = ClientThrottle::new(1, 1, vec!["127.0.0.1".to_string()]);

        for _ in 0..50 {
            assert_ok!(throttle.check("127.0.0.1"));
        }
        assert_eq!(throttle.client_count(), 0);
    }

    #[test]
    fn test_cleanup_drops_idle_clients() {
        let throttle = ClientThrottle::new(3, 10, vec![]).with_max_idle(Duration::ZERO);
        throttle.check("192.168.1.1").ok();
        throttle.check("192.168.1.2").ok();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(throttle.cleanup(), 2);
        assert_eq!(throttle.client_count(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let throttle = ClientThrottle::new(1, 1, vec![]);
        let clone = throttle.clone();

        assert_ok!(throttle.check("10.1.1.1"));
        assert_err!(clone.check("10.1.1.1"));
    }
}
