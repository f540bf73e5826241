//! Upstream request execution
//!
//! Sends the relayed GET to the target, directly or through a proxy from the
//! pool, and turns the upstream response into a client response whose body
//! is streamed through the size-capped pipe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, LOCATION};
use hyper::{Response, StatusCode};
use reqwest::Client;
use tracing::{debug, error, instrument, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::models::RequestContext;
use crate::relay::body::{capped_pipe, empty, RelayBody};
use crate::relay::headers::HeaderFilter;

/// Executes relayed requests against upstream targets
pub struct UpstreamForwarder {
    direct: Client,
    /// One client per proxy address, built once at startup
    proxied: HashMap<Arc<str>, Client>,
    headers: HeaderFilter,
    size_limit: u64,
}

impl UpstreamForwarder {
    /// Build the direct client and one client per proxy address
    pub fn new(config: &RelayConfig, proxies: &[Arc<str>]) -> Result<Self> {
        let direct = build_client(config.connect_timeout, config.request_timeout, None)?;

        let mut proxied = HashMap::with_capacity(proxies.len());
        for address in proxies {
            let client =
                build_client(config.connect_timeout, config.request_timeout, Some(&**address))?;
            proxied.insert(address.clone(), client);
        }

        Ok(Self {
            direct,
            proxied,
            headers: HeaderFilter::new(),
            size_limit: config.response_size_limit,
        })
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<&Client> {
        match proxy {
            None => Ok(&self.direct),
            Some(address) => self
                .proxied
                .get(address)
                .ok_or_else(|| RelayError::Internal(format!("No client for proxy {}", address))),
        }
    }

    /// Relay `ctx` upstream, optionally through `proxy`.
    ///
    /// Fails before any body is produced when the upstream cannot be reached
    /// or declares a body larger than the limit.
    #[instrument(skip(self, ctx, proxy), fields(target_url = %ctx.target_url, proxy = proxy.unwrap_or("direct")))]
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        proxy: Option<&str>,
    ) -> Result<Response<RelayBody>> {
        let client = self.client_for(proxy)?;
        let headers = self
            .headers
            .forward_to_upstream(&ctx.headers, ctx.remote_addr.ip());

        let upstream = client
            .get(&ctx.target_url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                error!(
                    target_url = %ctx.target_url,
                    proxy = proxy.unwrap_or("direct"),
                    error = %e,
                    "Upstream request failed"
                );
                RelayError::UpstreamTransport(e)
            })?;

        let status = upstream.status();
        debug!(status = status.as_u16(), "Received upstream response");

        if let Some(declared) = declared_length(upstream.headers()) {
            if declared > self.size_limit {
                warn!(
                    target_url = %ctx.target_url,
                    declared,
                    limit = self.size_limit,
                    "Upstream declared a body over the size limit"
                );
                return Err(RelayError::PayloadTooLarge {
                    limit: self.size_limit,
                });
            }
        }

        if self.headers.upstream_allows_any_origin(upstream.headers()) {
            debug!(target_url = %ctx.target_url, "Target already allows any origin, redirecting");
            return redirect_to(&ctx.target_url);
        }

        let client_headers = self.headers.forward_to_client(upstream.headers());
        let body = capped_pipe(
            upstream.bytes_stream(),
            self.size_limit,
            ctx.target_url.clone(),
        );

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = client_headers;
        Ok(response)
    }
}

fn build_client(
    connect_timeout: Duration,
    request_timeout: Duration,
    proxy: Option<&str>,
) -> Result<Client> {
    let builder = Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(request_timeout);

    let builder = match proxy {
        Some(address) => builder.proxy(reqwest::Proxy::all(address).map_err(|e| {
            RelayError::InvalidConfig(format!("Invalid proxy address {}: {}", address, e))
        })?),
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|e| RelayError::InvalidConfig(format!("Failed to build HTTP client: {}", e)))
}

fn declared_length(headers: &hyper::HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Send the browser straight to a target that already serves wildcard CORS
fn redirect_to(target_url: &str) -> Result<Response<RelayBody>> {
    let location = HeaderValue::from_str(target_url)
        .map_err(|_| RelayError::InvalidRequest(format!("Unusable target URL: {}", target_url)))?;

    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(LOCATION, location);
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    Ok(response)
}
