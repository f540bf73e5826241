//! Header rewriting between the client and the upstream

use std::net::IpAddr;

use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONNECTION, CONTENT_LENGTH,
    COOKIE, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, SET_COOKIE, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};

use crate::models::X_FORWARDED_FOR;

/// Client headers never sent upstream
fn is_denied_client_header(name: &HeaderName) -> bool {
    name == HOST || name == COOKIE
}

/// Upstream headers never sent to the client
fn is_denied_upstream_header(name: &HeaderName) -> bool {
    name == SET_COOKIE || name == CONNECTION || name == ACCESS_CONTROL_ALLOW_ORIGIN
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    name == CONNECTION
        || name == PROXY_AUTHENTICATE
        || name == PROXY_AUTHORIZATION
        || name == TE
        || name == TRAILER
        || name == TRANSFER_ENCODING
        || name == UPGRADE
        || name.as_str() == "keep-alive"
}

/// Bidirectional header allow/deny rewriting
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderFilter;

impl HeaderFilter {
    pub fn new() -> Self {
        Self
    }

    /// Headers for the outbound request.
    ///
    /// Drops `host` and `cookie`, and extends the X-Forwarded-For chain with
    /// the immediate client address. Hop-by-hop headers and the length of the
    /// (bodiless) client request belong to the inbound connection only.
    pub fn forward_to_upstream(&self, client: &HeaderMap, client_addr: IpAddr) -> HeaderMap {
        let mut upstream = HeaderMap::with_capacity(client.len() + 1);
        let mut chain: Vec<&str> = Vec::new();

        for (name, value) in client {
            if name.as_str() == X_FORWARDED_FOR {
                if let Ok(hops) = value.to_str() {
                    let hops = hops.trim();
                    if !hops.is_empty() {
                        chain.push(hops);
                    }
                }
                continue;
            }

            if is_denied_client_header(name) || is_hop_by_hop_header(name) || name == CONTENT_LENGTH {
                continue;
            }

            upstream.append(name.clone(), value.clone());
        }

        let client_addr = client_addr.to_string();
        chain.push(&client_addr);

        if let Ok(value) = HeaderValue::from_str(&chain.join(", ")) {
            upstream.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
        }

        upstream
    }

    /// Headers for the client response, with wildcard CORS attached
    pub fn forward_to_client(&self, upstream: &HeaderMap) -> HeaderMap {
        let mut client = HeaderMap::with_capacity(upstream.len() + 1);

        for (name, value) in upstream {
            if is_denied_upstream_header(name) {
                continue;
            }
            client.append(name.clone(), value.clone());
        }

        client.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        client
    }

    /// True when the upstream already lets any origin read the response
    pub fn upstream_allows_any_origin(&self, upstream: &HeaderMap) -> bool {
        upstream
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim() == "*")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_static(value),
            );
        }
        headers
    }

    fn client_ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    #[test]
    fn test_upstream_drops_host_and_cookie() {
        let client = map(&[
            ("Host", "relay.example"),
            ("Cookie", "session=secret"),
            ("Accept", "application/json"),
            ("Origin", "https://app.example"),
        ]);

        let upstream = HeaderFilter::new().forward_to_upstream(&client, client_ip());

        assert!(upstream.get(HOST).is_none());
        assert!(upstream.get(COOKIE).is_none());
        assert_eq!(upstream["accept"], "application/json");
        assert_eq!(upstream["origin"], "https://app.example");
    }

    #[test]
    fn test_upstream_keeps_duplicate_values_and_value_case() {
        let client = map(&[("X-Custom", "One"), ("x-custom", "TWO")]);

        let upstream = HeaderFilter::new().forward_to_upstream(&client, client_ip());

        let values: Vec<_> = upstream.get_all("x-custom").iter().collect();
        assert_eq!(values, vec!["One", "TWO"]);
    }

    #[test]
    fn test_upstream_starts_forwarded_for_chain() {
        let upstream = HeaderFilter::new().forward_to_upstream(&HeaderMap::new(), client_ip());
        assert_eq!(upstream[X_FORWARDED_FOR], "203.0.113.7");
    }

    #[test]
    fn test_upstream_extends_forwarded_for_chain() {
        let client = map(&[("X-Forwarded-For", "198.51.100.1, 10.0.0.2")]);

        let upstream = HeaderFilter::new().forward_to_upstream(&client, client_ip());

        assert_eq!(upstream.get_all(X_FORWARDED_FOR).iter().count(), 1);
        assert_eq!(
            upstream[X_FORWARDED_FOR],
            "198.51.100.1, 10.0.0.2, 203.0.113.7"
        );
    }

    #[test]
    fn test_client_drops_set_cookie_connection_and_upstream_cors() {
        let upstream = map(&[
            ("Set-Cookie", "tracking=1"),
            ("Connection", "close"),
            ("Access-Control-Allow-Origin", "https://only.example"),
            ("Content-Type", "text/html; charset=UTF-8"),
            ("Cache-Control", "max-age=60"),
        ]);

        let client = HeaderFilter::new().forward_to_client(&upstream);

        assert!(client.get(SET_COOKIE).is_none());
        assert!(client.get(CONNECTION).is_none());
        assert_eq!(client[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(client["content-type"], "text/html; charset=UTF-8");
        assert_eq!(client["cache-control"], "max-age=60");
    }

    #[test]
    fn test_denied_headers_never_cross_in_either_direction() {
        let both = map(&[
            ("Cookie", "a=1"),
            ("Host", "x.example"),
            ("Set-Cookie", "b=2"),
            ("Connection", "keep-alive"),
            ("X-Trace", "abc"),
        ]);
        let filter = HeaderFilter::new();

        let upstream = filter.forward_to_upstream(&both, client_ip());
        let client = filter.forward_to_client(&both);

        for name in [COOKIE, HOST] {
            assert!(!upstream.contains_key(&name), "{} leaked upstream", name);
        }
        for name in [SET_COOKIE, CONNECTION] {
            assert!(!client.contains_key(&name), "{} leaked to client", name);
        }
        assert_eq!(upstream["x-trace"], "abc");
        assert_eq!(client["x-trace"], "abc");
    }

    #[test]
    fn test_upstream_allows_any_origin() {
        let filter = HeaderFilter::new();
        assert!(filter.upstream_allows_any_origin(&map(&[("Access-Control-Allow-Origin", "*")])));
        assert!(!filter.upstream_allows_any_origin(&map(&[(
            "Access-Control-Allow-Origin",
            "https://a.example"
        )])));
        assert!(!filter.upstream_allows_any_origin(&HeaderMap::new()));
    }
}
