//! Payment endpoints.
//!
//! Thin wrappers over the guest payment API. The payment record is
//! server-owned; staff acceptance populates the discount out-of-band, and
//! this client only reads it back. Online payments hand off to the
//! backend's checkout URL and are confirmed on return.

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use crate::api::ApiClient;
use crate::error::{Error, Result};
use crate::model::{Payment, PaymentMethod};

// ---------------------------------------------------------------------------
// Source seam
// ---------------------------------------------------------------------------

/// What the engine asks the backend to do with the payment. Carries the
/// client-derived tip and the staff-granted discount so the server charges
/// the same grand total the guest saw.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub method: PaymentMethod,
    pub return_url: Option<String>,
    pub tip_amount: f64,
    pub discount_amount: f64,
}

/// Response to payment initiation.
#[derive(Debug, Clone)]
pub struct PaymentInitiation {
    pub payment: Payment,
    pub checkout_url: Option<String>,
    pub total_amount: f64,
}

/// Payment operations the billing engine depends on. `ApiClient` is the
/// production implementation; tests substitute fakes.
pub trait PaymentSource: Send + Sync {
    fn fetch<'a>(&'a self, payment_id: &'a str) -> BoxFuture<'a, Result<Payment>>;

    /// Payment for an order, if one has been created. Payment records can
    /// outlive the "active order" view, which is what makes the cached
    /// order-id recovery path work.
    fn fetch_by_order<'a>(&'a self, order_id: &'a str)
        -> BoxFuture<'a, Result<Option<Payment>>>;

    fn initiate<'a>(&'a self, req: &'a PaymentRequest) -> BoxFuture<'a, Result<PaymentInitiation>>;

    fn confirm<'a>(&'a self, payment_id: &'a str, status: &'a str)
        -> BoxFuture<'a, Result<Payment>>;
}

impl PaymentSource for ApiClient {
    fn fetch<'a>(&'a self, payment_id: &'a str) -> BoxFuture<'a, Result<Payment>> {
        Box::pin(get_payment(self, payment_id))
    }

    fn fetch_by_order<'a>(
        &'a self,
        order_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Payment>>> {
        Box::pin(get_payment_by_order(self, order_id))
    }

    fn initiate<'a>(&'a self, req: &'a PaymentRequest) -> BoxFuture<'a, Result<PaymentInitiation>> {
        Box::pin(initiate_payment(self, req))
    }

    fn confirm<'a>(
        &'a self,
        payment_id: &'a str,
        status: &'a str,
    ) -> BoxFuture<'a, Result<Payment>> {
        Box::pin(confirm_payment(self, payment_id, status))
    }
}

// ---------------------------------------------------------------------------
// Endpoint wrappers
// ---------------------------------------------------------------------------

fn parse_payment(data: Value) -> Result<Payment> {
    serde_json::from_value(data)
        .map_err(|e| Error::Transport(format!("Invalid payment payload: {e}")))
}

/// Get a payment by id.
pub async fn get_payment(api: &ApiClient, payment_id: &str) -> Result<Payment> {
    let data = api.get(&format!("/payments/guest/{payment_id}")).await?;
    parse_payment(data)
}

/// Get the payment attached to an order, if one exists.
pub async fn get_payment_by_order(api: &ApiClient, order_id: &str) -> Result<Option<Payment>> {
    let data = match api.get(&format!("/payments/guest/order/{order_id}")).await {
        Ok(data) => data,
        Err(Error::Api { status: 404, .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    if data.is_null() {
        return Ok(None);
    }
    parse_payment(data).map(Some)
}

/// Initiate a payment. For online payments the response carries the
/// checkout URL the guest is redirected to.
pub async fn initiate_payment(api: &ApiClient, req: &PaymentRequest) -> Result<PaymentInitiation> {
    let mut body = json!({
        "method": req.method,
        "tipAmount": req.tip_amount,
        "discountAmount": req.discount_amount,
    });
    if let Some(url) = req.return_url.as_deref() {
        body["returnUrl"] = json!(url);
    }

    let data = api.post("/payments/guest", body).await?;
    let payment = parse_payment(data.get("payment").cloned().unwrap_or(Value::Null))?;
    let checkout_url = data
        .get("checkoutUrl")
        .or_else(|| data.get("checkout_url"))
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| payment.checkout_url.clone());
    let total_amount = data
        .get("totalAmount")
        .or_else(|| data.get("total_amount"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    info!(payment_id = %payment.id, method = ?req.method, "payment initiated");
    Ok(PaymentInitiation {
        payment,
        checkout_url,
        total_amount,
    })
}

/// Confirm a payment outcome. The gateway's own webhook may have advanced
/// the record already; the server treats a repeat confirmation of the same
/// status as a no-op.
pub async fn confirm_payment(api: &ApiClient, payment_id: &str, status: &str) -> Result<Payment> {
    let data = api
        .post(
            &format!("/payments/guest/{payment_id}/confirm"),
            json!({ "status": status }),
        )
        .await?;
    let payment = parse_payment(data)?;
    info!(payment_id = %payment.id, status = ?payment.status, "payment confirmed");
    Ok(payment)
}

// ===========================================================================
// Tests
// ===========================================================================
