//! Relay request handler
//!
//! Runs every inbound request through the admission pipeline: load shedding,
//! routing, policy, per-client throttling, then either the global burst
//! limiter (direct mode) or a proxy from the pool, and finally the upstream
//! forwarder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS,
    CONTENT_TYPE,
};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::config::{Config, ThrottleOn};
use crate::error::{RelayError, Result};
use crate::models::{ProxySelection, RequestContext};
use crate::relay::body::{empty, full, RelayBody};
use crate::relay::forwarder::UpstreamForwarder;
use crate::relay::middleware::{Admission, BurstLimiter, ClientThrottle};
use crate::relay::policy::PolicyGate;
use crate::relay::rotation::ProxyPools;
use crate::services::LagMonitor;

/// Path answered with service status instead of being relayed
pub const HEALTH_PATH: &str = "/health";

/// Preflight answers may be cached for a day
const PREFLIGHT_MAX_AGE_SECS: u32 = 86_400;

/// How outbound requests are admitted
pub enum RelayMode {
    /// Straight to the target, behind the global burst limiter
    Direct(BurstLimiter),
    /// Through a proxy picked from the pool
    Proxied(ProxyPools),
}

impl RelayMode {
    pub fn name(&self) -> &'static str {
        match self {
            RelayMode::Direct(_) => "direct",
            RelayMode::Proxied(_) => "proxied",
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus<'a> {
    status: &'static str,
    service: &'a str,
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    strategy: Option<&'static str>,
    proxies: usize,
    available_proxies: usize,
    lag_ms: f64,
    max_lag_ms: u64,
}

/// End-to-end handler owning every piece of shared relay state
pub struct RelayHandler {
    service_name: String,
    load_shed: Arc<LagMonitor>,
    policy: PolicyGate,
    throttle: ClientThrottle,
    throttle_on: ThrottleOn,
    mode: RelayMode,
    forwarder: UpstreamForwarder,
}

impl RelayHandler {
    pub fn new(
        service_name: impl Into<String>,
        load_shed: Arc<LagMonitor>,
        policy: PolicyGate,
        throttle: ClientThrottle,
        throttle_on: ThrottleOn,
        mode: RelayMode,
        forwarder: UpstreamForwarder,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            load_shed,
            policy,
            throttle,
            throttle_on,
            mode,
            forwarder,
        }
    }

    /// Wire the handler from configuration.
    ///
    /// Fails when proxies are enabled but a proxy list is missing, empty or
    /// holds an unusable address.
    pub fn from_config(
        config: &Config,
        load_shed: Arc<LagMonitor>,
        throttle: ClientThrottle,
    ) -> Result<Self> {
        let (mode, forwarder) = if config.proxy.enabled {
            let pools = ProxyPools::from_config(&config.proxy)?;
            let forwarder = UpstreamForwarder::new(&config.relay, &pools.addresses())?;
            (RelayMode::Proxied(pools), forwarder)
        } else {
            let limiter = BurstLimiter::from_config(&config.proxy);
            let forwarder = UpstreamForwarder::new(&config.relay, &[])?;
            (RelayMode::Direct(limiter), forwarder)
        };

        Ok(Self::new(
            config.server.name.clone(),
            load_shed,
            PolicyGate::from_config(&config.relay),
            throttle,
            config.throttle.key,
            mode,
            forwarder,
        ))
    }

    pub fn mode(&self) -> &RelayMode {
        &self.mode
    }

    /// Handle one inbound request. Never fails: errors become responses.
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri(), client = %remote_addr))]
    pub async fn handle<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<RelayBody> {
        if self.load_shed.is_overloaded() {
            debug!("Shedding request while overloaded");
            return RelayError::Overloaded.into_response();
        }

        let (parts, _) = req.into_parts();

        let result = match parts.method {
            Method::OPTIONS => self.preflight(&parts),
            Method::GET if parts.uri.path() == HEALTH_PATH => self.health(),
            Method::GET => self.relay(&parts, remote_addr).await,
            _ => Err(RelayError::MethodNotAllowed),
        };

        result.unwrap_or_else(|e| {
            if e.is_server_error() {
                error!(error = %e, "Request failed");
            } else {
                debug!(error = %e, status = e.status_code().as_u16(), "Request rejected");
            }
            e.into_response()
        })
    }

    async fn relay(
        &self,
        parts: &http::request::Parts,
        remote_addr: SocketAddr,
    ) -> Result<Response<RelayBody>> {
        let ctx = RequestContext::from_parts(parts, remote_addr)?;

        self.policy.validate(&ctx)?;
        ctx.parse_target()?;
        self.throttle.check(&ctx.client_key(self.throttle_on))?;

        let proxy = self.admit(&ctx)?;
        self.forwarder.forward(&ctx, proxy.as_deref()).await
    }

    /// Take a burst slot or a proxy for the request
    fn admit(&self, ctx: &RequestContext) -> Result<Option<Arc<str>>> {
        match &self.mode {
            RelayMode::Direct(limiter) => match limiter.admit() {
                Admission::Admitted => Ok(None),
                Admission::Blocked { retry_after } => Err(RelayError::RateLimited {
                    retry_after_ms: retry_after.as_millis() as u64,
                }),
            },
            RelayMode::Proxied(pools) => {
                let pool = pools.for_target(ctx.is_secure_target);
                match pool.acquire(Instant::now()) {
                    ProxySelection::Selected(address) => {
                        debug!(proxy = %address, "Selected proxy");
                        Ok(Some(address))
                    }
                    ProxySelection::AllBusy { wait } => {
                        let wait_ms = pool_wait_ms(wait);
                        warn!(wait_ms, "Every proxy is cooling down");
                        Err(RelayError::ProxyPoolExhausted { wait_ms })
                    }
                }
            }
        }
    }

    /// Answer a CORS preflight for the root or any relay path
    fn preflight(&self, parts: &http::request::Parts) -> Result<Response<RelayBody>> {
        let path = parts.uri.path();
        if path != "/" {
            crate::models::target_from_path(path)?;
        }

        let mut response = Response::new(empty());
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET"));
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(PREFLIGHT_MAX_AGE_SECS));
        if let Some(requested) = parts.headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }

        Ok(response)
    }

    fn health(&self) -> Result<Response<RelayBody>> {
        let now = Instant::now();
        let (strategy, proxies, available_proxies) = match &self.mode {
            RelayMode::Direct(_) => (None, 0, 0),
            RelayMode::Proxied(pools) => (
                Some(pools.strategy_name()),
                pools.len(),
                pools.available_count(now),
            ),
        };

        let status = HealthStatus {
            status: "ok",
            service: &self.service_name,
            mode: self.mode.name(),
            strategy,
            proxies,
            available_proxies,
            lag_ms: self.load_shed.current_lag().as_secs_f64() * 1000.0,
            max_lag_ms: self.load_shed.max_lag().as_millis() as u64,
        };

        let body = serde_json::to_vec(&status)
            .map_err(|e| RelayError::Internal(format!("Failed to encode health status: {}", e)))?;

        let mut response = Response::new(full(body));
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        Ok(response)
    }
}

/// Whole milliseconds until a proxy frees up, rounded up and never zero
fn pool_wait_ms(wait: Duration) -> u64 {
    (wait.as_micros() as u64).div_ceil(1000).max(1)
}
