use rand::Rng;

use crate::config::Route;

/// TCPShield RealIP separator. Its presence in the handshake address means an
/// upstream proxy already injected (or wants us to inject) the client IP.
pub const REALIP_SEPARATOR: &str = "///";

pub const DEFAULT_BACKEND_PORT: u16 = 25565;

/// Reduce a raw handshake server address to the hostname used for routing:
/// drop everything from the first NUL (Forge/Fabric extra data), trim trailing
/// dots, and drop any RealIP trailer. Casing is preserved; matching lowercases
/// separately so the forwarded payload keeps the client's original bytes.
pub fn clear_virtual_host(raw: &str) -> &str {
    let mut s = raw.split('\0').next().unwrap_or(raw);
    s = s.trim_end_matches('.');
    if let Some(i) = s.find(REALIP_SEPARATOR) {
        s = &s[..i];
    }
    s.trim_end_matches('.')
}

pub fn is_real_ip(server_address: &str) -> bool {
    server_address.contains(REALIP_SEPARATOR)
}

/// Build the outbound RealIP address: `<cleared-host>///<client-ip>/<unix-ms>`.
pub fn real_ip_address(server_address: &str, client_ip: std::net::IpAddr, now_ms: u64) -> String {
    format!(
        "{}{}{}/{}",
        clear_virtual_host(server_address),
        REALIP_SEPARATOR,
        client_ip,
        now_ms
    )
}

/// First-match route lookup: routes in configuration order, each route's
/// patterns in order. Returns the pattern that matched alongside the route.
pub fn find_route<'a>(host: &str, routes: &'a [Route]) -> Option<(&'a str, &'a Route)> {
    let host = host.to_ascii_lowercase();
    for route in routes {
        for pattern in &route.hosts {
            if host_matches(pattern, &host) {
                return Some((pattern.as_str(), route));
            }
        }
    }
    None
}

// Both sides lowercased by the callers. `*.suffix` matches the apex and any
// proper subdomain, never a partial label ("wx.y" does not match "*.x.y").
fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix
            || (host.len() > suffix.len()
                && host.ends_with(suffix)
                && host.as_bytes()[host.len() - suffix.len() - 1] == b'.');
    }
    pattern == host
}

/// Uniform random pick from the route's backend set.
pub fn pick_backend(route: &Route) -> Option<&str> {
    if route.backends.is_empty() {
        return None;
    }
    let idx = rand::rng().random_range(0..route.backends.len());
    Some(route.backends[idx].as_str())
}

/// Normalize a configured backend into a dialable `host:port`, defaulting the
/// port to 25565 when it is missing or 0. Returns None when the string has no
/// host part or an unparseable port.
pub fn backend_addr(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    // Look for the port separator after any IPv6 bracket.
    let tail_start = s.rfind(']').map(|i| i + 1).unwrap_or(0);
    let colon = s[tail_start..].rfind(':').map(|i| tail_start + i);
    let Some(colon) = colon else {
        return Some(format!("{s}:{DEFAULT_BACKEND_PORT}"));
    };
    let (host_part, port_part) = (&s[..colon], &s[colon + 1..]);
    if host_part.is_empty() {
        return None;
    }
    match port_part.parse::<u16>() {
        Ok(0) => Some(format!("{host_part}:{DEFAULT_BACKEND_PORT}")),
        Ok(_) => Some(s.to_string()),
        Err(_) => None,
    }
}
