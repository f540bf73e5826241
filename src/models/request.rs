use std::net::SocketAddr;

use hyper::header::HeaderMap;
use url::Url;

use crate::config::ThrottleOn;
use crate::error::{RelayError, Result};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Per-request view of an inbound relay request
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Absolute upstream URL taken from the request path
    pub target_url: String,
    /// True when the target uses the https scheme
    pub is_secure_target: bool,
    /// Inbound headers as delivered by the server (duplicates preserved)
    pub headers: HeaderMap,
    /// Socket peer address of the client
    pub remote_addr: SocketAddr,
    /// Inbound X-Forwarded-For chain, if any
    pub forwarded_for: Option<String>,
}

impl RequestContext {
    /// Derive the context from the request head.
    ///
    /// The target is everything after the leading slash, query included.
    pub fn from_parts(parts: &http::request::Parts, remote_addr: SocketAddr) -> Result<Self> {
        let target_url = target_from_path(
            parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/"),
        )?;

        let forwarded_for = parts
            .headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(Self {
            is_secure_target: target_url.starts_with("https://"),
            target_url,
            headers: parts.headers.clone(),
            remote_addr,
            forwarded_for,
        })
    }

    /// Parse the target as an absolute URL with a host.
    ///
    /// Kept apart from `from_parts` so policy checks run on the raw target
    /// before a malformed URL is reported.
    pub fn parse_target(&self) -> Result<Url> {
        let parsed = Url::parse(&self.target_url)?;
        if parsed.host_str().is_none() {
            return Err(RelayError::InvalidRequest(format!(
                "Target URL has no host: {}",
                self.target_url
            )));
        }
        Ok(parsed)
    }

    /// Key identifying the client for throttling
    pub fn client_key(&self, on: ThrottleOn) -> String {
        match on {
            ThrottleOn::Ip => self.remote_addr.ip().to_string(),
            ThrottleOn::ForwardedFor => self
                .forwarded_for
                .as_deref()
                .and_then(|chain| chain.split(',').next())
                .map(str::trim)
                .filter(|hop| !hop.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| self.remote_addr.ip().to_string()),
        }
    }
}

/// Extract the absolute target URL from a relay path like `/https://host/x`.
pub fn target_from_path(path_and_query: &str) -> Result<String> {
    let target = path_and_query.strip_prefix('/').unwrap_or(path_and_query);

    if !is_relay_target(target) {
        return Err(RelayError::NotFound(path_and_query.to_string()));
    }

    Ok(target.to_string())
}

/// True when `target` names an absolute http(s) URL with something after the scheme
pub fn is_relay_target(target: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        target
            .strip_prefix(scheme)
            .is_some_and(|rest| !rest.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;

    fn parts(uri: &str, headers: &[(&str, &str)]) -> http::request::Parts {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn remote() -> SocketAddr {
        "203.0.113.7:51000".parse().unwrap()
    }

    #[test]
    fn test_target_keeps_query_string() {
        let ctx = RequestContext::from_parts(
            &parts("/https://example.com/data.json?page=2&q=a", &[]),
            remote(),
        )
        .unwrap();

        assert_eq!(ctx.target_url, "https://example.com/data.json?page=2&q=a");
        assert!(ctx.is_secure_target);
    }

    #[test]
    fn test_plain_http_target_is_not_secure() {
        let ctx = RequestContext::from_parts(&parts("/http://example.com/", &[]), remote()).unwrap();
        assert!(!ctx.is_secure_target);
    }

    #[test]
    fn test_non_relay_paths_are_not_found() {
        for path in ["/", "/favicon.ico", "/ftp://example.com/", "/http://"] {
            let err = target_from_path(path).unwrap_err();
            assert!(matches!(err, RelayError::NotFound(_)), "path {}", path);
        }
    }

    #[test]
    fn test_unparsable_target_is_invalid_request() {
        let ctx = RequestContext::from_parts(&parts("/http://example.com:99999/", &[]), remote()).unwrap();
        assert_eq!(ctx.target_url, "http://example.com:99999/");

        let err = ctx.parse_target().unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }

    #[test]
    fn test_parse_target_accepts_absolute_url() {
        let ctx = RequestContext::from_parts(&parts("/https://example.com:8443/a?b=c", &[]), remote()).unwrap();
        let url = ctx.parse_target().unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.port(), Some(8443));
    }

    #[test]
    fn test_client_key_by_ip_ignores_forwarded_for() {
        let ctx = RequestContext::from_parts(
            &parts("/http://example.com/", &[("x-forwarded-for", "198.51.100.1")]),
            remote(),
        )
        .unwrap();

        assert_eq!(ctx.client_key(ThrottleOn::Ip), "203.0.113.7");
    }

    #[test]
    fn test_client_key_by_forwarded_for_uses_first_hop() {
        let ctx = RequestContext::from_parts(
            &parts(
                "/http://example.com/",
                &[("X-Forwarded-For", " 198.51.100.1, 10.0.0.2")],
            ),
            remote(),
        )
        .unwrap();

        assert_eq!(ctx.forwarded_for.as_deref(), Some("198.51.100.1, 10.0.0.2"));
        assert_eq!(ctx.client_key(ThrottleOn::ForwardedFor), "198.51.100.1");
    }

    #[test]
    fn test_client_key_by_forwarded_for_falls_back_to_ip() {
        let ctx = RequestContext::from_parts(&parts("/http://example.com/", &[]), remote()).unwrap();
        assert_eq!(ctx.client_key(ThrottleOn::ForwardedFor), "203.0.113.7");
    }
}
