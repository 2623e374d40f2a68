//! Ordering service API client.
//!
//! Authenticated HTTP communication with the backend: the `{success, data}`
//! envelope is unwrapped here, guest headers (table id, client session id)
//! are attached to every request, and error text is normalized through
//! `error::extract_api_message` so all call sites surface the same message
//! for the same failure.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ClientConfig, TableSelection, CONNECTIVITY_TIMEOUT};
use crate::error::{extract_api_message, friendly_error, status_error, Error, Result};
use crate::storage::{keys, Storage};

/// HTTP client for the ordering service.
pub struct ApiClient {
    http: Client,
    config: ClientConfig,
    storage: Arc<Storage>,
}

impl ApiClient {
    pub fn new(config: ClientConfig, storage: Arc<Storage>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            storage,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The stored table selection, if the QR-scan flow has run.
    pub fn table_selection(&self) -> Option<TableSelection> {
        self.storage.get_typed(keys::TABLE_SELECTION)
    }

    // -----------------------------------------------------------------------
    // Request plumbing
    // -----------------------------------------------------------------------

    /// Perform a request against the ordering service and unwrap the
    /// `{success, data}` envelope.
    ///
    /// `path` includes the leading slash, e.g. `/orders/guest`. Mutating
    /// requests carry a fresh idempotency key so a retried submission is
    /// deduplicated server-side.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}{path}", self.config.base_url);
        let mutating = method != Method::GET;

        let mut req = self
            .http
            .request(method, &url)
            .header("x-client-session", self.storage.client_session_id())
            .header("Content-Type", "application/json");

        if let Some(table) = self.table_selection() {
            req = req.header("x-table-id", table.table_id);
        }
        if let Some(token) = self.config.auth.customer_token.as_deref() {
            req = req.bearer_auth(token);
        }
        if mutating {
            req = req.header("Idempotency-Key", Uuid::new_v4().to_string());
        }
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.config.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body_text)
                .ok()
                .as_ref()
                .and_then(extract_api_message)
                .unwrap_or_else(|| status_error(status));
            debug!(%url, status = status.as_u16(), "request failed: {message}");
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }

        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        let parsed: Value = serde_json::from_str(&body_text)
            .map_err(|e| Error::Transport(format!("Invalid JSON from ordering service: {e}")))?;

        unwrap_envelope(status, parsed)
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    // -----------------------------------------------------------------------
    // Connectivity test
    // -----------------------------------------------------------------------

    /// Lightweight health-check against the ordering service.
    pub async fn test_connectivity(&self) -> ConnectivityResult {
        let health_url = format!("{}/health", self.config.base_url);

        let client = match Client::builder().timeout(CONNECTIVITY_TIMEOUT).build() {
            Ok(c) => c,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(format!("Failed to create HTTP client: {e}")),
                };
            }
        };

        let start = Instant::now();
        let resp = match client.get(&health_url).send().await {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(friendly_error(&self.config.base_url, &e).to_string()),
                };
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        let status = resp.status();

        if status.is_success() {
            info!(latency_ms = latency, "connectivity test passed");
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(status_error(status)),
            }
        }
    }
}

/// Result of a connectivity test.
#[derive(Debug, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Unwrap the backend's `{success, data}` envelope. A `success: false`
/// body becomes an API error with the extracted message; responses without
/// an envelope pass through as-is.
fn unwrap_envelope(status: StatusCode, body: Value) -> Result<Value> {
    match body.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(body.get("data").cloned().unwrap_or(Value::Null)),
        Some(false) => {
            let message =
                extract_api_message(&body).unwrap_or_else(|| "Request was rejected".to_string());
            Err(Error::Api {
                status: status.as_u16(),
                message,
            })
        }
        None => Ok(body),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
