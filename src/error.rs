//! Error taxonomy for the Tableside client engine.
//!
//! Transport failures, API rejections, and local storage problems are kept
//! distinct so callers can tell a retryable fetch failure from "no table
//! selected" or the terminal "order unavailable" state. Backend error text
//! is normalized through a single extraction routine so every surface shows
//! the same message for the same failure.

use reqwest::StatusCode;
use serde_json::Value;

/// Client engine error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Network-level failure (connect, timeout, DNS). Retryable.
    #[error("{0}")]
    Transport(String),

    /// The backend answered with a non-success status or a `success: false`
    /// envelope.
    #[error("{message}")]
    Api { status: u16, message: String },

    /// Guest order creation requires a stored table selection.
    #[error("No table selected. Scan the table QR code to start an order.")]
    TableNotSelected,

    /// Input rejected before any network call (empty cart, bad selection).
    #[error("{0}")]
    Validation(String),

    /// Local storage failure (open, write).
    #[error("storage: {0}")]
    Storage(String),

    /// Terminal state: the order could not be loaded after all retries and
    /// no cached payment could be recovered. Recoverable by navigating back
    /// to the menu and requesting the bill again.
    #[error("Unable to load your order. Please request the bill again from the menu.")]
    OrderUnavailable,

    /// Realtime socket failure (connect, handshake).
    #[error("socket: {0}")]
    Socket(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status of an API error, if this is one.
    pub fn api_status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly transport error.
pub(crate) fn friendly_error(url: &str, err: &reqwest::Error) -> Error {
    if err.is_connect() {
        return Error::Transport(format!("Cannot reach the ordering service at {url}"));
    }
    if err.is_timeout() {
        return Error::Transport(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return Error::Transport(format!("Invalid ordering service URL: {url}"));
    }
    Error::Transport(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
pub(crate) fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session is invalid or expired".to_string(),
        403 => "Not authorized for this table".to_string(),
        404 => "Not found".to_string(),
        s if s >= 500 => format!("Ordering service error (HTTP {s})"),
        s => format!("Unexpected response from ordering service (HTTP {s})"),
    }
}

/// Extract the backend's error message from a response body.
///
/// Checks, in order: a direct `message` field, a nested `data.message`,
/// and a nested `response.data.message`. Every call site goes through this
/// so error banners stay consistent.
pub fn extract_api_message(body: &Value) -> Option<String> {
    let direct = body.get("message").and_then(Value::as_str);
    let nested = body
        .get("data")
        .and_then(|d| d.get("message"))
        .and_then(Value::as_str);
    let deep = body
        .get("response")
        .and_then(|r| r.get("data"))
        .and_then(|d| d.get("message"))
        .and_then(Value::as_str);

    direct
        .or(nested)
        .or(deep)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ===========================================================================
// Tests
// ===========================================================================
