//! Server-owned data model: orders, order items, payments.
//!
//! The backend speaks camelCase JSON but older deployments emitted
//! snake_case, so every field carries an alias. The client only ever holds
//! snapshots of these records; the server is authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

/// Order-level status as the client sees it. The kitchen-side intermediate
/// statuses (accepted, preparing, confirmed) collapse into `Active`; item
/// progress is tracked per [`OrderItem`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    #[serde(alias = "accepted", alias = "preparing", alias = "confirmed", alias = "in_progress")]
    Active,
    PaymentPending,
    Served,
    Completed,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal and payment states take display precedence over item
    /// progress.
    pub fn overrides_item_progress(self) -> bool {
        matches!(
            self,
            OrderStatus::PaymentPending
                | OrderStatus::Completed
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Active => "active",
            OrderStatus::PaymentPending => "payment_pending",
            OrderStatus::Served => "served",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

/// Per-item kitchen progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderItemStatus {
    Pending,
    Accepted,
    Preparing,
    Ready,
    Served,
    Rejected,
}

// ---------------------------------------------------------------------------
// Order records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemOption {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "option_name", alias = "name")]
    pub option_name: String,
    #[serde(default, alias = "price_at_time")]
    pub price_at_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: String,
    #[serde(alias = "menu_item_id")]
    pub menu_item_id: String,
    #[serde(default, alias = "menu_item_name")]
    pub menu_item_name: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default, alias = "unit_price")]
    pub unit_price: f64,
    #[serde(default, alias = "special_request")]
    pub special_request: Option<String>,
    pub status: OrderItemStatus,
    #[serde(default, alias = "order_item_options")]
    pub order_item_options: Vec<OrderItemOption>,
    #[serde(default, alias = "rejected_reason", alias = "rejection_note")]
    pub rejected_reason: Option<String>,
}

fn default_quantity() -> u32 {
    1
}

impl OrderItem {
    /// Derived line total: `quantity * (unit_price + option prices)`,
    /// rounded to cents.
    pub fn line_total(&self) -> f64 {
        let options: f64 = self.order_item_options.iter().map(|o| o.price_at_time).sum();
        crate::totals::round_cents(f64::from(self.quantity) * (self.unit_price + options))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    #[serde(default, alias = "total_amount")]
    pub total_amount: f64,
    #[serde(default, alias = "order_items", alias = "items")]
    pub order_items: Vec<OrderItem>,
    #[serde(default, alias = "table_number")]
    pub table_number: Option<String>,
    #[serde(default, alias = "guest_name")]
    pub guest_name: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, alias = "created_at")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Items that still count toward progress and billing.
    pub fn active_items(&self) -> impl Iterator<Item = &OrderItem> {
        self.order_items
            .iter()
            .filter(|i| i.status != OrderItemStatus::Rejected)
    }
}

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Accepted,
    Success,
    Failed,
}

/// How the guest settles the bill. Online payment goes through the
/// backend's Stripe checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Stripe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub status: PaymentStatus,
    #[serde(default, alias = "order_id")]
    pub order_id: Option<String>,
    /// Percentage discount granted by staff on acceptance (0-100).
    #[serde(default, alias = "discount_rate")]
    pub discount_rate: f64,
    /// Absolute discount amount; authoritative when positive.
    #[serde(default, alias = "discount_amount")]
    pub discount_amount: f64,
    #[serde(default, alias = "stripe_session_id")]
    pub stripe_session_id: Option<String>,
    #[serde(default, alias = "checkout_url")]
    pub checkout_url: Option<String>,
    #[serde(default, alias = "total_amount")]
    pub total_amount: Option<f64>,
}

// ===========================================================================
// Tests
// ===========================================================================
