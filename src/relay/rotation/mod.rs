//! Proxy rotation strategies
//!
//! This module provides the strategies for picking the upstream proxy a
//! relayed request goes out through.

mod cooldown;
mod round_robin;

pub use cooldown::CooldownSelector;
pub use round_robin::RoundRobinSelector;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{ProxyPoolConfig, RotationStrategy};
use crate::error::{RelayError, Result};
use crate::models::{load_proxy_list, ProxySelection};

/// Trait for proxy selection strategies
///
/// `acquire` picks a proxy and records its use in one step, so two requests
/// can never both take the last free slot of a proxy.
pub trait ProxySelector: Send + Sync {
    /// Select the next proxy and mark it used, or report how long to wait
    fn acquire(&self, now: Instant) -> ProxySelection;

    /// Addresses of every proxy in the pool, in rotation order
    fn addresses(&self) -> Vec<Arc<str>>;

    /// Proxies that could be selected at `now`
    fn available_addresses(&self, now: Instant) -> Vec<Arc<str>>;

    /// Number of proxies that could be selected at `now`
    fn available_count(&self, now: Instant) -> usize {
        self.available_addresses(now).len()
    }

    /// Total number of proxies in the pool
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the strategy name
    fn strategy_name(&self) -> &'static str;
}

/// Create a proxy selector based on the strategy type
///
/// An empty address list is rejected so misconfiguration surfaces at startup.
pub fn create_selector(
    strategy: RotationStrategy,
    addresses: Vec<String>,
    quota: u32,
    cooldown: Duration,
) -> Result<Arc<dyn ProxySelector>> {
    if addresses.is_empty() {
        return Err(RelayError::InvalidConfig(
            "Proxies are enabled, but the proxy pool is empty".into(),
        ));
    }

    Ok(match strategy {
        RotationStrategy::Cooldown => Arc::new(CooldownSelector::new(addresses, quota, cooldown)),
        RotationStrategy::RoundRobin => Arc::new(RoundRobinSelector::new(addresses)),
    })
}

/// Proxy pools, optionally split by target scheme
#[derive(Clone)]
pub struct ProxyPools {
    default: Arc<dyn ProxySelector>,
    secure: Option<Arc<dyn ProxySelector>>,
}

impl ProxyPools {
    pub fn new(default: Arc<dyn ProxySelector>, secure: Option<Arc<dyn ProxySelector>>) -> Self {
        Self { default, secure }
    }

    /// Load the configured proxy list(s) and build the selectors
    pub fn from_config(config: &ProxyPoolConfig) -> Result<Self> {
        let build = |addresses: Vec<String>| {
            create_selector(
                config.strategy,
                addresses,
                config.requests_till_rate_limit,
                config.rate_limit_sleep,
            )
        };

        let default = build(load_proxy_list(&config.list_path)?)?;
        let secure = match &config.https_list_path {
            Some(path) => Some(build(load_proxy_list(path)?)?),
            None => None,
        };

        Ok(Self::new(default, secure))
    }

    /// Pool serving targets of the given scheme
    pub fn for_target(&self, is_secure_target: bool) -> &Arc<dyn ProxySelector> {
        match (&self.secure, is_secure_target) {
            (Some(secure), true) => secure,
            _ => &self.default,
        }
    }

    /// Every distinct proxy address across the pools
    pub fn addresses(&self) -> Vec<Arc<str>> {
        merge_distinct(
            self.default.addresses(),
            self.secure.as_ref().map(|s| s.addresses()),
        )
    }

    /// Number of distinct proxies across the pools
    pub fn len(&self) -> usize {
        self.addresses().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct proxies free in at least one pool at `now`
    pub fn available_count(&self, now: Instant) -> usize {
        merge_distinct(
            self.default.available_addresses(now),
            self.secure.as_ref().map(|s| s.available_addresses(now)),
        )
        .len()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.default.strategy_name()
    }
}

fn merge_distinct(mut addresses: Vec<Arc<str>>, extra: Option<Vec<Arc<str>>>) -> Vec<Arc<str>> {
    for address in extra.into_iter().flatten() {
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }
    addresses
}
