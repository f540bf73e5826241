//! Scheduler lag monitor
//!
//! Repeatedly sleeps for a fixed interval and measures how late the runtime
//! wakes it up. The overshoot is smoothed and compared to a threshold; the
//! request handler sheds every request while the smoothed lag is above it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::LoadShedConfig;

/// Weight of the previous lag value when folding in a new sample
const SMOOTHING_FACTOR: u64 = 3;

/// Shared lag reading plus the overload threshold
#[derive(Debug)]
pub struct LagMonitor {
    /// Smoothed lag in microseconds
    lag_micros: AtomicU64,
    max_lag: Duration,
    sample_interval: Duration,
}

impl LagMonitor {
    pub fn new(max_lag: Duration, sample_interval: Duration) -> Self {
        Self {
            lag_micros: AtomicU64::new(0),
            max_lag,
            sample_interval,
        }
    }

    pub fn from_config(config: &LoadShedConfig) -> Self {
        Self::new(config.max_lag, config.sample_interval)
    }

    /// True while the smoothed lag is above the configured maximum
    pub fn is_overloaded(&self) -> bool {
        self.current_lag() > self.max_lag
    }

    pub fn current_lag(&self) -> Duration {
        Duration::from_micros(self.lag_micros.load(Ordering::Relaxed))
    }

    pub fn max_lag(&self) -> Duration {
        self.max_lag
    }

    /// Fold one raw lag sample into the smoothed value and return it
    pub fn record_sample(&self, sample: Duration) -> Duration {
        let sample = sample.as_micros() as u64;
        let prev = self.lag_micros.load(Ordering::Relaxed);
        let lag = (prev * (SMOOTHING_FACTOR - 1) + sample) / SMOOTHING_FACTOR;
        self.lag_micros.store(lag, Ordering::Relaxed);

        let lag = Duration::from_micros(lag);
        if lag > self.max_lag {
            warn!(
                lag_ms = lag.as_millis() as u64,
                max_lag_ms = self.max_lag.as_millis() as u64,
                "Event loop lag over threshold, shedding load"
            );
        }
        lag
    }

    /// Run the sampling loop until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting lag monitor (max lag: {} ms, interval: {} ms)",
            self.max_lag.as_millis(),
            self.sample_interval.as_millis()
        );

        loop {
            let started = Instant::now();

            tokio::select! {
                _ = sleep(self.sample_interval) => {
                    let overshoot = started.elapsed().saturating_sub(self.sample_interval);
                    let lag = self.record_sample(overshoot);
                    debug!(lag_us = lag.as_micros() as u64, "Lag sample");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Lag monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle for managing the lag monitor
pub struct LagMonitorHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl LagMonitorHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for LagMonitorHandle {
    fn default() -> Self {
        Self::new().0
    }
}
