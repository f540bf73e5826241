//! Global burst-then-cooldown limiter used when no proxy pool is configured
//!
//! The first `quota` requests after a reset pass immediately. The request
//! that would exceed the quota is refused and schedules a single deferred
//! reset at `now + cooldown`. Every request refused while that reset is
//! pending is told the time left until it fires.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::ProxyPoolConfig;

/// Result of asking the burst limiter for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Blocked { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Debug, Default)]
struct BurstState {
    call_count: u32,
    reset_at: Option<Instant>,
    reset_task: Option<JoinHandle<()>>,
}

/// Process-wide burst counter with a one-shot deferred reset
#[derive(Clone)]
pub struct BurstLimiter {
    state: Arc<Mutex<BurstState>>,
    quota: u32,
    cooldown: Duration,
}

impl BurstLimiter {
    pub fn new(quota: u32, cooldown: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BurstState::default())),
            quota,
            cooldown,
        }
    }

    pub fn from_config(config: &ProxyPoolConfig) -> Self {
        Self::new(config.requests_till_rate_limit, config.rate_limit_sleep)
    }

    /// Admit one request now.
    ///
    /// Must be called from within a tokio runtime, since a refusal may
    /// schedule the reset task.
    pub fn admit(&self) -> Admission {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&self, now: Instant) -> Admission {
        let mut state = self.state.lock();

        if state.call_count < self.quota {
            state.call_count += 1;
            debug!(call_count = state.call_count, quota = self.quota, "Burst admission");
            return Admission::Admitted;
        }

        let reset_at = match state.reset_at {
            Some(reset_at) => reset_at,
            None => {
                let reset_at = now + self.cooldown;
                state.reset_at = Some(reset_at);
                state.reset_task = Some(spawn_reset(Arc::downgrade(&self.state), reset_at));
                warn!(
                    quota = self.quota,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "Burst quota exhausted, blocking until reset"
                );
                reset_at
            }
        };

        Admission::Blocked {
            retry_after: reset_at.saturating_duration_since(now),
        }
    }

    /// Admissions counted since the last reset
    pub fn call_count(&self) -> u32 {
        self.state.lock().call_count
    }

    /// Instant the pending reset fires, if one is scheduled
    pub fn pending_reset(&self) -> Option<Instant> {
        self.state.lock().reset_at
    }

    /// Cancel a pending reset task
    pub fn shutdown(&self) {
        if let Some(task) = self.state.lock().reset_task.take() {
            task.abort();
        }
    }
}

fn spawn_reset(state: Weak<Mutex<BurstState>>, reset_at: Instant) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep_until(reset_at).await;

        let Some(state) = state.upgrade() else {
            return;
        };

        let mut state = state.lock();
        state.call_count = 0;
        state.reset_at = None;
        state.reset_task = None;
        info!("Burst limiter reset");
    })
}
