//! Throttle cleanup service
//!
//! Periodically drops the token buckets of clients that went quiet, so the
//! per-client map does not grow with every address ever seen.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, instrument};

use crate::relay::middleware::ClientThrottle;

/// How often idle clients are swept
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct ThrottleCleanupService {
    throttle: ClientThrottle,
    sweep_interval: Duration,
}

impl ThrottleCleanupService {
    pub fn new(throttle: ClientThrottle, sweep_interval: Duration) -> Self {
        Self {
            throttle,
            sweep_interval,
        }
    }

    /// Run the sweep loop until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting throttle cleanup service (interval: {}s)",
            self.sweep_interval.as_secs()
        );

        let mut sweep = interval(self.sweep_interval);
        sweep.tick().await; // Skip immediate tick

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let removed = self.throttle.cleanup();
                    if removed > 0 {
                        debug!(
                            removed,
                            remaining = self.throttle.client_count(),
                            "Dropped idle client throttles"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Throttle cleanup service shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle for managing the throttle cleanup service
pub struct ThrottleCleanupHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ThrottleCleanupHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for ThrottleCleanupHandle {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweeps_idle_clients_and_stops() {
        let throttle = ClientThrottle::new(3, 10, vec![]).with_max_idle(Duration::ZERO);
        throttle.check("192.168.1.1").ok();
        assert_eq!(throttle.client_count(), 1);

        let service = ThrottleCleanupService::new(throttle.clone(), Duration::from_millis(20));
        let (handle, shutdown) = ThrottleCleanupHandle::new();
        let task = tokio::spawn(async move { service.run(shutdown).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(throttle.client_count(), 0);

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cleanup service did not stop")
            .unwrap();
    }
}
