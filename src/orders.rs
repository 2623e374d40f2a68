//! Order-session operations.
//!
//! Thin wrappers over the guest/customer order endpoints. The single
//! current order for a table is fetched here; absence is a valid outcome
//! (`Ok(None)`), kept distinct from transport failures so the retry logic
//! upstream can tell "no order yet" from "could not ask".

use futures_util::future::BoxFuture;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::cart::{CartItem, CartStore};
use crate::error::{Error, Result};
use crate::model::Order;
use crate::storage::keys;

// ---------------------------------------------------------------------------
// Source seam
// ---------------------------------------------------------------------------

/// Order operations the session and billing engines depend on. `ApiClient`
/// is the production implementation; tests substitute fakes.
pub trait OrderSource: Send + Sync {
    /// Fetch the single current order for this table/session.
    fn fetch_current(&self) -> BoxFuture<'_, Result<Option<Order>>>;

    /// Ask the kitchen for the bill; returns the updated order.
    fn request_bill<'a>(&'a self, order_id: &'a str) -> BoxFuture<'a, Result<Order>>;
}

impl OrderSource for ApiClient {
    fn fetch_current(&self) -> BoxFuture<'_, Result<Option<Order>>> {
        Box::pin(get_current_order(self))
    }

    fn request_bill<'a>(&'a self, order_id: &'a str) -> BoxFuture<'a, Result<Order>> {
        Box::pin(request_bill(self, order_id))
    }
}

// ---------------------------------------------------------------------------
// Current order
// ---------------------------------------------------------------------------

/// Get the current order for the caller's table. `Ok(None)` when the table
/// has no active order (404 or an empty envelope); errors only for real
/// failures.
pub async fn get_current_order(api: &ApiClient) -> Result<Option<Order>> {
    let data = match api.get("/orders/guest").await {
        Ok(data) => data,
        Err(Error::Api { status: 404, .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    if data.is_null() {
        return Ok(None);
    }
    let order: Order = serde_json::from_value(data)
        .map_err(|e| Error::Transport(format!("Invalid order payload: {e}")))?;
    Ok(Some(order))
}

// ---------------------------------------------------------------------------
// Order creation
// ---------------------------------------------------------------------------

fn items_payload(items: &[CartItem]) -> Value {
    json!(items)
}

/// Create an order from cart lines.
///
/// Guests must have a stored table selection (set by the QR-scan flow);
/// authenticated customers go through the customer endpoint and the server
/// binds the table from their session.
pub async fn create_order(
    api: &ApiClient,
    items: &[CartItem],
    guest_name: Option<&str>,
    notes: Option<&str>,
) -> Result<Order> {
    let mut body = json!({ "items": items_payload(items) });
    if let Some(name) = guest_name {
        body["guestName"] = json!(name);
    }
    if let Some(notes) = notes {
        body["notes"] = json!(notes);
    }

    let data = if api.config().auth.is_customer() {
        api.post("/orders/customer", body).await?
    } else {
        let table = api.table_selection().ok_or(Error::TableNotSelected)?;
        body["tableId"] = json!(table.table_id);
        api.post("/orders/guest", body).await?
    };

    let order: Order = serde_json::from_value(data)
        .map_err(|e| Error::Transport(format!("Invalid order payload: {e}")))?;
    info!(order_id = %order.id, items = items.len(), "order created");
    Ok(order)
}

/// Place the cart as an order and clear it. The cart is only cleared once
/// the create call has succeeded.
pub async fn place_order(
    api: &ApiClient,
    cart: &CartStore,
    guest_name: Option<&str>,
    notes: Option<&str>,
) -> Result<Order> {
    let items = cart.items();
    if items.is_empty() {
        return Err(Error::Validation("Cart is empty".to_string()));
    }
    let order = create_order(api, &items, guest_name, notes).await?;
    cart.clear();
    Ok(order)
}

// ---------------------------------------------------------------------------
// Bill + table service
// ---------------------------------------------------------------------------

/// Request the bill for an order. Safe to retry: the server is
/// authoritative on the order status, so a lost response just means the
/// next attempt (or fetch) observes `payment_pending` already set.
pub async fn request_bill(api: &ApiClient, order_id: &str) -> Result<Order> {
    let data = api
        .post("/orders/guest/request-bill", json!({ "orderId": order_id }))
        .await?;
    let order: Order = serde_json::from_value(data)
        .map_err(|e| Error::Transport(format!("Invalid order payload: {e}")))?;
    info!(order_id = %order.id, status = order.status.as_str(), "bill requested");
    Ok(order)
}

/// Withdraw a pending bill request. Non-critical: a failure is surfaced as
/// a transient notice, never fatal to the session.
pub async fn cancel_bill_request(api: &ApiClient) -> Result<()> {
    api.request(Method::POST, "/orders/guest/cancel-bill", None)
        .await?;
    Ok(())
}

/// Ping staff to come to the table. Non-critical, fire-and-acknowledge.
pub async fn call_waiter(api: &ApiClient) -> Result<String> {
    let data = api
        .request(Method::POST, "/orders/guest/call-waiter", None)
        .await?;
    let message = data
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Staff has been notified")
        .to_string();
    Ok(message)
}

/// Remember the order id that a payment flow is in progress for, so the
/// return-from-checkout path can recover it.
pub fn remember_pending_payment(api: &ApiClient, order_id: &str) {
    api.storage()
        .session_set(keys::PENDING_PAYMENT_ORDER_ID, order_id);
}

/// The order id cached by [`remember_pending_payment`], if any.
pub fn pending_payment_order_id(api: &ApiClient) -> Option<String> {
    match api.storage().session_get(keys::PENDING_PAYMENT_ORDER_ID) {
        Some(id) if !id.trim().is_empty() => Some(id),
        Some(_) => {
            warn!("pending payment marker is blank, ignoring");
            None
        }
        None => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
