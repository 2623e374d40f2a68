//! Client configuration.
//!
//! Everything the engine needs to talk to the backend is carried in an
//! explicitly constructed [`ClientConfig`]: no module-level singletons, so
//! tests can build throwaway configs freely. Also hosts the decoder for the
//! table QR deep-link payload that seeds the stored table selection.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the ordering service base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Strip trailing slashes again (in case "/api/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Derive the realtime socket URL from the normalised base URL.
///
/// The orders namespace lives at `/orders` on the same host; http maps to
/// ws and https to wss.
pub fn derive_socket_url(base_url: &str) -> String {
    let base = normalize_base_url(base_url);
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base
    };
    format!("{ws}/orders")
}

// ---------------------------------------------------------------------------
// Table selection (QR deep link)
// ---------------------------------------------------------------------------

/// The table a guest session is bound to, as selected by the QR-scan flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSelection {
    #[serde(alias = "table_id")]
    pub table_id: String,
    #[serde(alias = "table_number")]
    pub table_number: String,
}

fn decode_deep_link_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 8 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Decode a table QR deep-link payload into a [`TableSelection`].
///
/// Accepts plain JSON or base64url-encoded JSON with `tableId`/`table_id`
/// and `tableNumber`/`table_number` fields.
pub fn decode_table_qr_payload(raw: &str) -> Option<TableSelection> {
    let value = decode_deep_link_payload(raw)?;
    serde_json::from_value::<TableSelection>(value)
        .ok()
        .filter(|t| !t.table_id.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Auth boundary
// ---------------------------------------------------------------------------

/// Opaque view of the authentication provider: either an anonymous guest or
/// an authenticated customer with a bearer token. Token refresh and login
/// live outside this crate.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub customer_token: Option<String>,
}

impl Auth {
    pub fn guest() -> Self {
        Self::default()
    }

    pub fn customer(token: impl Into<String>) -> Self {
        Self {
            customer_token: Some(token.into()),
        }
    }

    /// True when an authenticated customer session is present.
    pub fn is_customer(&self) -> bool {
        self.customer_token
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Client config
// ---------------------------------------------------------------------------

/// Configuration for one client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub socket_url: String,
    pub timeout: Duration,
    pub auth: Auth,
}

impl ClientConfig {
    /// Build a config from a base URL, normalising it and deriving the
    /// socket URL.
    pub fn new(base_url: &str) -> Self {
        let base = normalize_base_url(base_url);
        let socket_url = derive_socket_url(&base);
        Self {
            base_url: base,
            socket_url,
            timeout: DEFAULT_TIMEOUT,
            auth: Auth::guest(),
        }
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ===========================================================================
// Tests
// ===========================================================================
