//! Client identity resolution.
//!
//! Rate limit state is partitioned by a [`ClientIdentity`]: an opaque string
//! derived from proxy headers or, failing that, the peer address.
//!
//! Proxy headers are trusted as-is. Without a reverse proxy that overwrites
//! them, a client can pick its own identity and sidestep its limits.

use axum::http::HeaderMap;

/// Identity used when the connection address is not available at all.
///
/// Header values go through [`strip_port`], which drops brackets, so a
/// `Forwarded` node cannot resolve to this.
pub const UNKNOWN_CLIENT: &str = "[unknown]";

const FORWARDED: &str = "forwarded";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// The key that identifies a request's origin for rate limiting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Wrap an already resolved identity string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Resolve the identity of a request. First match wins:
    ///
    /// 1. `Forwarded: for=...` (quotes and port stripped)
    /// 2. first entry of `X-Forwarded-For`
    /// 3. `X-Real-IP`
    /// 4. `remote_addr` with its port stripped, or unmodified if it has none
    ///
    /// Malformed or empty headers are skipped, never rejected.
    pub fn resolve(headers: &HeaderMap, remote_addr: Option<&str>) -> Self {
        let resolved = forwarded_for(headers)
            .or_else(|| x_forwarded_for(headers))
            .or_else(|| x_real_ip(headers))
            .unwrap_or_else(|| match remote_addr {
                Some(addr) => strip_port(addr).to_string(),
                None => UNKNOWN_CLIENT.to_string(),
            });
        Self(resolved)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// The first `for=` parameter of an RFC 7239 `Forwarded` header.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let value = header_str(headers, FORWARDED)?;

    value
        .split(',')
        .flat_map(|element| element.split(';'))
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            key.trim().eq_ignore_ascii_case("for").then_some(value)
        })
        .map(|node| node.trim().trim_matches('"'))
        // RFC 7239 `unknown` carries no identity
        .find(|node| !node.is_empty() && !node.eq_ignore_ascii_case("unknown"))
        .map(|node| strip_port(node).to_string())
}

fn x_forwarded_for(headers: &HeaderMap) -> Option<String> {
    let value = header_str(headers, X_FORWARDED_FOR)?;
    let first = value.split(',').next()?.trim();
    (!first.is_empty()).then(|| first.to_string())
}

fn x_real_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, X_REAL_IP).map(str::to_string)
}

/// Strip a trailing `:port` from `host:port` or `[v6]:port`.
///
/// A bracketed IPv6 literal without a port loses its brackets. Anything
/// else that does not look like `host:port` is returned unchanged.
fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, "")) => host,
            Some((host, port)) if port.starts_with(':') => host,
            _ => addr,
        };
    }

    match addr.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}
