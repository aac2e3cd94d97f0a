//! Client address extraction for rate-limit keys.
//!
//! # Header Priority
//!
//! 1. First entry of `X-Forwarded-For`
//! 2. `X-Real-IP`
//! 3. Peer socket address (axum `ConnectInfo`)
//! 4. [`UNKNOWN_IP`]
//!
//! # Security Warning: IP Spoofing Risk
//!
//! Forwarded headers are client-controlled unless a reverse proxy overwrites
//! them. Configure `TRUSTED_PROXIES` with the proxy's CIDR ranges: forwarded
//! headers arriving from any other peer are then ignored and the peer address
//! is used instead.
//!
//! ```nginx
//! # nginx example - overwrites any client-provided header
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! ## The "unknown" Fallback
//!
//! When no address can be determined, all such requests share the `"unknown"`
//! key and are limited collectively.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use tracing::{debug, warn};

/// Fallback key when no client address can be determined.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is treated as a single-host range. Returns `None` if the
    /// format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = match cidr.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr.trim(), None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok()?,
            None => max_prefix,
        };
        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            // IPv4 and IPv6 don't match
            _ => false,
        }
    }
}

/// Networks allowed to set forwarded-for headers.
///
/// Empty means every peer is trusted.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Invalid CIDR strings are logged as warnings and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether forwarded headers from `peer` may be believed.
    pub fn is_trusted(&self, peer: &IpAddr) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(peer))
    }
}

// =============================================================================
// Extraction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp<'a> {
    FromXff(&'a str),
    FromRealIp(&'a str),
    NotFound,
}

/// Read the client address from proxy headers without allocating.
#[inline]
fn extract_ip_from_headers(headers: &HeaderMap) -> ExtractedIp<'_> {
    // Format: "client, proxy1, proxy2" - we want the first (client) entry
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return ExtractedIp::FromXff(first_ip);
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return ExtractedIp::FromRealIp(value.trim());
    }

    ExtractedIp::NotFound
}

/// Best-known client address for keying quotas.
///
/// Returns `Cow::Borrowed` only for the [`UNKNOWN_IP`] fallback.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: &TrustedProxyConfig,
) -> Cow<'static, str> {
    let peer_ip = peer.map(|addr| addr.ip());

    let headers_trusted = match peer_ip {
        Some(ip) => trusted_proxies.is_trusted(&ip),
        // No socket info (e.g. in-process calls): nothing to validate against
        None => true,
    };

    if headers_trusted {
        match extract_ip_from_headers(headers) {
            ExtractedIp::FromXff(ip) | ExtractedIp::FromRealIp(ip) => {
                return Cow::Owned(ip.to_string());
            }
            ExtractedIp::NotFound => {}
        }
    } else if extract_ip_from_headers(headers) != ExtractedIp::NotFound {
        debug!(
            peer = ?peer_ip,
            "Ignoring forwarded-for headers from untrusted peer"
        );
    }

    match peer_ip {
        Some(ip) => Cow::Owned(ip.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(addr.parse().unwrap())
    }

    #[test]
    fn test_xff_first_entry_wins() {
        let h = headers(&[("x-forwarded-for", "  192.168.1.1  , 10.0.0.1")]);
        assert_eq!(
            client_ip(&h, None, &TrustedProxyConfig::default()),
            "192.168.1.1"
        );
    }

    #[test]
    fn test_xff_priority_over_real_ip() {
        let h = headers(&[("x-forwarded-for", "10.0.0.1"), ("x-real-ip", "192.168.1.1")]);
        assert_eq!(client_ip(&h, None, &TrustedProxyConfig::default()), "10.0.0.1");
    }

    #[test]
    fn test_real_ip_then_peer_then_unknown() {
        let trusted = TrustedProxyConfig::default();

        let h = headers(&[("x-real-ip", "::1")]);
        assert_eq!(client_ip(&h, peer("10.1.1.1:5000"), &trusted), "::1");

        let h = HeaderMap::new();
        assert_eq!(client_ip(&h, peer("10.1.1.1:5000"), &trusted), "10.1.1.1");

        let ip = client_ip(&h, None, &trusted);
        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_empty_xff_falls_through() {
        let h = headers(&[("x-forwarded-for", "  "), ("x-real-ip", "203.0.113.9")]);
        assert_eq!(
            client_ip(&h, None, &TrustedProxyConfig::default()),
            "203.0.113.9"
        );
    }

    #[test]
    fn test_untrusted_peer_cannot_spoof() {
        let trusted = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let h = headers(&[("x-forwarded-for", "1.2.3.4")]);

        assert_eq!(client_ip(&h, peer("10.0.0.5:443"), &trusted), "1.2.3.4");
        assert_eq!(client_ip(&h, peer("8.8.8.8:443"), &trusted), "8.8.8.8");
    }

    #[test]
    fn test_xff_with_ipv6_and_port_passed_through() {
        let h = headers(&[("x-forwarded-for", "2001:db8::1, 10.0.0.1")]);
        assert_eq!(
            client_ip(&h, None, &TrustedProxyConfig::default()),
            "2001:db8::1"
        );

        let h = headers(&[("x-forwarded-for", "192.168.1.1:8080")]);
        assert_eq!(
            client_ip(&h, None, &TrustedProxyConfig::default()),
            "192.168.1.1:8080"
        );
    }

    // ==========================================================================
    // CIDR Range Tests
    // ==========================================================================

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len, 128);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
        assert!(CidrRange::parse("10.0.0.0/8/1").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("192.168.1.0/24").unwrap();
        assert!(cidr.contains(&"192.168.1.254".parse().unwrap()));
        assert!(!cidr.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));

        let all = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(all.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_config() {
        let empty = TrustedProxyConfig::new(&[]);
        assert!(!empty.is_enabled());
        assert!(empty.is_trusted(&"1.2.3.4".parse().unwrap()));

        let config = TrustedProxyConfig::new(&[
            "10.0.0.0/8".to_string(),
            "bogus".to_string(),
            "172.16.0.0/12".to_string(),
        ]);
        assert!(config.is_enabled());
        assert!(config.is_trusted(&"172.31.255.255".parse().unwrap()));
        assert!(!config.is_trusted(&"192.168.1.1".parse().unwrap()));
    }
}
