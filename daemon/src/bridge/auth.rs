//! Connection authorization for the push channel and protected HTTP routes.
//!
//! Two kinds of callers are trusted:
//! - the browser extension, identified by its `chrome-extension://<id>` origin
//!   (optionally pinned to one allow-listed id)
//! - anything else presenting the shared secret as a bearer token
//!
//! With no secret configured, non-extension callers are accepted (dev mode).
//! A `?token=` query parameter is never a credential: secrets in URLs end up
//! in logs and history.

use once_cell::sync::Lazy;
use regex::Regex;

/// Scheme prefix of browser-extension origins
pub const EXTENSION_ORIGIN_PREFIX: &str = "chrome-extension://";

static EXTENSION_ORIGIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^chrome-extension://([A-Za-z]{32})$").expect("extension origin regex")
});

/// What the handshake tells us about an inbound connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// `Origin` header
    pub origin: Option<String>,
    /// Request target, including any query string
    pub url: Option<String>,
    /// `Host` header
    pub host: Option<String>,
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
}

/// Decide whether a connection is trusted.
///
/// Never reveals which rule failed; callers only get pass/fail.
pub fn verify(
    info: &ConnectionInfo,
    shared_secret: Option<&str>,
    allowed_extension_id: Option<&str>,
) -> bool {
    if let Some(extension_id) = info.origin.as_deref().and_then(extension_id_from_origin) {
        return match allowed_extension_id {
            Some(allowed) => extension_id.eq_ignore_ascii_case(allowed),
            None => true,
        };
    }

    authorize_bearer(info.authorization.as_deref(), shared_secret)
}

/// Check an `Authorization` header against the shared secret.
///
/// No secret configured means open access.
pub fn authorize_bearer(authorization: Option<&str>, shared_secret: Option<&str>) -> bool {
    let Some(secret) = shared_secret else {
        return true;
    };

    match authorization.map(bearer_token) {
        Some(token) if !token.is_empty() => constant_time_eq(token.as_bytes(), secret.as_bytes()),
        _ => false,
    }
}

/// Extract the 32-letter extension id from an extension origin
pub fn extension_id_from_origin(origin: &str) -> Option<&str> {
    EXTENSION_ORIGIN_RE
        .captures(origin)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Strip a literal `"Bearer "` prefix if present
pub fn bearer_token(authorization: &str) -> &str {
    authorization
        .strip_prefix("Bearer ")
        .unwrap_or(authorization)
}

/// Compare two byte strings without an early exit on the first difference.
///
/// Unequal lengths return `false` immediately; the length of the secret is
/// not what needs protecting.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
