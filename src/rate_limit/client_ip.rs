use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

/// Resolve the client address used in rate-limit keys.
///
/// `trusted_headers` is consulted in order; `x-forwarded-for` contributes its
/// first (client-most) entry. Values that don't parse as an IP address are
/// skipped so a forged header can't inject arbitrary text into the key. Falls
/// back to the socket peer, then to `"unknown"`.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trusted_headers: &[String]) -> String {
    for name in trusted_headers {
        let Some(raw) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let candidate = if name.eq_ignore_ascii_case("x-forwarded-for") {
            raw.split(',').next().unwrap_or("")
        } else {
            raw
        };
        if let Ok(ip) = candidate.trim().parse::<IpAddr>() {
            return ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
