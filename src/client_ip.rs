//! Origin address resolution for the per-origin rate limit counter.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// Reported when no candidate is a valid address; all such callers share one counter.
pub const UNKNOWN_ORIGIN: &str = "0.0.0.0";

/// Proxy headers consulted before the peer address, highest priority first.
pub const DEFAULT_TRUSTED_HEADERS: &[&str] = &["cf-connecting-ip", "x-forwarded-for", "x-real-ip"];

#[derive(Debug, Clone)]
pub struct ClientIpResolver {
    trusted_headers: Vec<String>,
}

impl Default for ClientIpResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TRUSTED_HEADERS.iter().map(|h| h.to_string()).collect())
    }
}

impl ClientIpResolver {
    pub fn new(trusted_headers: Vec<String>) -> Self {
        Self { trusted_headers }
    }

    /// Walks the trusted headers in order, then the peer address. Values that
    /// do not parse as an address are skipped.
    pub fn resolve(&self, headers: &HashMap<String, String>, peer: Option<IpAddr>) -> String {
        self.trusted_headers
            .iter()
            .filter_map(|name| header_value(headers, name))
            .find_map(|value| {
                // Only the client end of a forwarding chain identifies the origin.
                let first = value.split(',').next().unwrap_or_default();
                parse_ip(first)
            })
            .or(peer)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string())
    }
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn parse_ip(candidate: &str) -> Option<IpAddr> {
    let candidate = candidate.trim();
    candidate
        .parse::<IpAddr>()
        .ok()
        .or_else(|| candidate.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}
