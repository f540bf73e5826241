//! Cooldown-scan proxy selection strategy

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::ProxySelector;
use crate::models::{ProxyEntry, ProxySelection};

/// Selects the first proxy that is not cooling down
///
/// Each proxy serves `quota` requests, then sits out for `cooldown`. When
/// every proxy is cooling down the caller is told how long until the
/// earliest one frees up.
pub struct CooldownSelector {
    entries: Mutex<Vec<ProxyEntry>>,
    quota: u32,
    cooldown: Duration,
}

impl CooldownSelector {
    pub fn new(addresses: Vec<String>, quota: u32, cooldown: Duration) -> Self {
        let now = Instant::now();
        let entries = addresses
            .into_iter()
            .map(|address| ProxyEntry::new(address, now))
            .collect();

        Self {
            entries: Mutex::new(entries),
            quota: quota.max(1),
            cooldown,
        }
    }

    /// Record one use of `entry`, starting its cooldown at the quota
    fn record_use(&self, entry: &mut ProxyEntry, now: Instant) {
        if entry.mark_used(now, self.quota, self.cooldown) {
            debug!(proxy = %entry.address(), cooldown_ms = self.cooldown.as_millis() as u64, "Proxy entered cooldown");
        }
    }
}

/// Index of the first available entry, or the shortest remaining wait
fn scan(entries: &[ProxyEntry], now: Instant) -> Result<usize, Duration> {
    if let Some(idx) = entries.iter().position(|e| e.is_available(now)) {
        return Ok(idx);
    }

    Err(entries
        .iter()
        .map(|e| e.available_at().saturating_duration_since(now))
        .min()
        .unwrap_or_default())
}

impl ProxySelector for CooldownSelector {
    fn acquire(&self, now: Instant) -> ProxySelection {
        let mut entries = self.entries.lock();

        match scan(&entries, now) {
            Ok(idx) => {
                let entry = &mut entries[idx];
                self.record_use(entry, now);
                ProxySelection::Selected(entry.address().clone())
            }
            Err(wait) => ProxySelection::AllBusy { wait },
        }
    }

    fn addresses(&self) -> Vec<Arc<str>> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.address().clone())
            .collect()
    }

    fn available_addresses(&self, now: Instant) -> Vec<Arc<str>> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.is_available(now))
            .map(|e| e.address().clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn strategy_name(&self) -> &'static str {
        "cooldown"
    }
}
