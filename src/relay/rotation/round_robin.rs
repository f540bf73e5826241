//! Round-robin proxy selection strategy

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

use super::ProxySelector;
use crate::models::ProxySelection;

/// Selects proxies in round-robin order, ignoring cooldown
///
/// Uses atomic operations for lock-free index tracking.
pub struct RoundRobinSelector {
    addresses: Vec<Arc<str>>,
    index: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses: addresses.into_iter().map(Arc::from).collect(),
            index: AtomicUsize::new(0),
        }
    }
}

impl ProxySelector for RoundRobinSelector {
    fn acquire(&self, _now: Instant) -> ProxySelection {
        // Pools are validated non-empty at construction time.
        let len = self.addresses.len().max(1);
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % len;

        match self.addresses.get(idx) {
            Some(address) => ProxySelection::Selected(address.clone()),
            None => ProxySelection::AllBusy {
                wait: std::time::Duration::ZERO,
            },
        }
    }

    fn addresses(&self) -> Vec<Arc<str>> {
        self.addresses.clone()
    }

    fn available_addresses(&self, _now: Instant) -> Vec<Arc<str>> {
        self.addresses.clone()
    }

    fn len(&self) -> usize {
        self.addresses.len()
    }

    fn strategy_name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_order() {
        let selector = RoundRobinSelector::new(vec![
            "http://127.0.0.1:8081".to_string(),
            "http://127.0.0.1:8082".to_string(),
            "http://127.0.0.1:8083".to_string(),
        ]);
        let now = Instant::now();

        // Should cycle through 1, 2, 3, 1, 2, 3...
        let picked: Vec<String> = (0..6).map(|_| selector.acquire(now).to_string()).collect();
        assert_eq!(
            picked,
            vec![
                "http://127.0.0.1:8081",
                "http://127.0.0.1:8082",
                "http://127.0.0.1:8083",
                "http://127.0.0.1:8081",
                "http://127.0.0.1:8082",
                "http://127.0.0.1:8083",
            ]
        );
    }

    #[test]
    fn test_round_robin_never_reports_busy() {
        let selector = RoundRobinSelector::new(vec!["http://127.0.0.1:8081".to_string()]);
        let now = Instant::now();

        for _ in 0..100 {
            assert!(selector.acquire(now).is_selected());
        }
        assert_eq!(selector.available_count(now), 1);
    }

    #[test]
    fn test_round_robin_empty_reports_busy() {
        let selector = RoundRobinSelector::new(vec![]);
        assert!(!selector.acquire(Instant::now()).is_selected());
        assert!(selector.is_empty());
    }
}
