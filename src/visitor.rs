// =============================================================================
// visitor.rs: WHO IS LOOKING?
// =============================================================================
//
// View dedup needs a stable-ish identity for anonymous visitors. The best we
// have is the client address, dug out of whatever proxy header the load
// balancer of the week decided to set. Loopback gets special treatment so
// that local traffic is keyed by machine rather than all landing on 127.0.0.1.
//
// This is an approximation. Headers can be forged, and everyone behind one
// NAT shares a key. Good enough for a popularity signal, useless for anything
// that needs to be tamper-proof.
// =============================================================================

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Proxy headers, most trusted first. The underscore spellings are what some
/// gateways forward verbatim from CGI-style environments.
pub const CLIENT_IP_HEADERS: &[&str] = &[
    "X-Forwarded-For",
    "Proxy-Client-IP",
    "WL-Proxy-Client-IP",
    "HTTP_CLIENT_IP",
    "HTTP_X_FORWARDED_FOR",
    "X-Real-IP",
    "X-RealIP",
    "REMOTE_ADDR",
];

const UNKNOWN: &str = "unknown";

/// Opaque identity of a visitor for view deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisitorKey(String);

impl VisitorKey {
    /// Use `raw` verbatim. For callers that already have a key, such as a
    /// session id.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Derive a key from the request.
    ///
    /// The first proxy header holding a usable value wins; for
    /// comma-separated chains the left-most hop (the original client) is
    /// taken. Without one, the socket address is used. Loopback resolves to
    /// `"{host_identity}/{addr}"`.
    pub fn resolve(headers: &HeaderMap, remote: Option<IpAddr>, host_identity: &str) -> Self {
        let candidate = CLIENT_IP_HEADERS
            .iter()
            .filter_map(|name| headers.get(*name))
            .filter_map(|value| value.to_str().ok())
            .filter_map(first_hop)
            .next()
            .map(str::to_string)
            .or_else(|| remote.map(|addr| addr.to_string()));

        match candidate {
            Some(addr) if is_loopback(&addr) => Self(format!("{host_identity}/{addr}")),
            Some(addr) => Self(addr),
            None => Self(UNKNOWN.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VisitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn first_hop(raw: &str) -> Option<&str> {
    let hop = raw.split(',').next()?.trim();
    if hop.is_empty() || hop.eq_ignore_ascii_case(UNKNOWN) {
        None
    } else {
        Some(hop)
    }
}

fn is_loopback(addr: &str) -> bool {
    match addr.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => addr == "0:0:0:0:0:0:0:1",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::net::Ipv4Addr;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_forwarded_for_takes_the_client_hop() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.2")]);
        let key = VisitorKey::resolve(&h, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))), "web-1");
        assert_eq!(key.as_str(), "203.0.113.7");
    }

    #[test]
    fn test_unknown_and_empty_headers_are_skipped() {
        let h = headers(&[("x-forwarded-for", "unknown"), ("proxy-client-ip", ""), ("x-real-ip", "198.51.100.4")]);
        let key = VisitorKey::resolve(&h, None, "web-1");
        assert_eq!(key.as_str(), "198.51.100.4");
    }

    #[test]
    fn test_falls_back_to_socket_address() {
        let key = VisitorKey::resolve(&HeaderMap::new(), Some("192.0.2.10".parse().unwrap()), "web-1");
        assert_eq!(key.as_str(), "192.0.2.10");
    }

    #[test]
    fn test_loopback_is_qualified_with_host_identity() {
        let v4 = VisitorKey::resolve(&HeaderMap::new(), Some("127.0.0.1".parse().unwrap()), "web-1");
        assert_eq!(v4.as_str(), "web-1/127.0.0.1");

        let v6 = VisitorKey::resolve(&HeaderMap::new(), Some("::1".parse().unwrap()), "web-1");
        assert_eq!(v6.as_str(), "web-1/::1");
    }

    #[test]
    fn test_no_address_at_all_is_unknown() {
        let key = VisitorKey::resolve(&HeaderMap::new(), None, "web-1");
        assert_eq!(key.as_str(), "unknown");
    }
}
