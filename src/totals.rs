//! Monetary derivations for the bill flow.
//!
//! Every step is rounded to cents before the next one runs, so repeated
//! derivations over the same inputs bit-match the displayed totals. The
//! discount is never guessed client-side: it comes from the payment record
//! once staff acceptance has populated it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Order, Payment};

/// Fixed tax rate applied to the post-discount subtotal.
pub const TAX_RATE: f64 = 0.10;

/// Tip presets offered to the guest.
pub const TIP_PRESETS: [u8; 3] = [10, 15, 20];

/// Round to 2 decimal places (cents).
pub fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Subtotal
// ---------------------------------------------------------------------------

/// Sum of line totals over non-rejected items, rounded to cents.
pub fn order_subtotal(order: &Order) -> f64 {
    round_cents(order.active_items().map(|i| i.line_total()).sum())
}

/// Subtotal used for billing: the server's `total_amount` when positive,
/// otherwise the item-derived sum. A stale/zero server total is never
/// trusted blindly.
pub fn effective_subtotal(order: &Order) -> f64 {
    let derived = order_subtotal(order);
    if order.total_amount > 0.0 {
        if derived > 0.0 && (order.total_amount - derived).abs() >= 0.01 {
            debug!(
                order_id = %order.id,
                server = order.total_amount,
                derived,
                "server total diverges from item-derived subtotal"
            );
        }
        round_cents(order.total_amount)
    } else {
        derived
    }
}

// ---------------------------------------------------------------------------
// Tip
// ---------------------------------------------------------------------------

/// The guest's tip choice. Stored alongside the order snapshot so a
/// restored receipt shows the same tip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tipMode", content = "customTip", rename_all = "snake_case")]
pub enum TipSelection {
    None,
    /// One of the fixed presets (10, 15, 20).
    Preset(u8),
    /// User-entered percentage; sanitized on read.
    Custom(f64),
}

impl Default for TipSelection {
    fn default() -> Self {
        TipSelection::None
    }
}

impl TipSelection {
    /// Effective tip percentage. Non-finite or non-positive custom input
    /// counts as no tip.
    pub fn percentage(self) -> f64 {
        match self {
            TipSelection::None => 0.0,
            TipSelection::Preset(p) => f64::from(p),
            TipSelection::Custom(p) => {
                if p.is_finite() && p > 0.0 {
                    p
                } else {
                    0.0
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bill pipeline
// ---------------------------------------------------------------------------

/// Fully derived bill amounts, each step cent-rounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillTotals {
    pub subtotal: f64,
    pub discount_amount: f64,
    pub subtotal_after_discount: f64,
    pub tax: f64,
    pub total: f64,
    pub tip_amount: f64,
    pub grand_total: f64,
}

/// Discount granted by the payment record: the absolute amount when
/// positive, otherwise derived from the rate. No payment, no discount.
pub fn discount_for(subtotal: f64, payment: Option<&Payment>) -> f64 {
    let Some(payment) = payment else {
        return 0.0;
    };
    if payment.discount_amount > 0.0 {
        round_cents(payment.discount_amount)
    } else if payment.discount_rate > 0.0 {
        round_cents(subtotal * payment.discount_rate / 100.0)
    } else {
        0.0
    }
}

impl BillTotals {
    /// Run the full derivation: subtotal, discount, tax, total, tip,
    /// grand total, in that order.
    pub fn derive(subtotal: f64, payment: Option<&Payment>, tip: TipSelection) -> Self {
        let subtotal = round_cents(subtotal);
        let discount_amount = discount_for(subtotal, payment);
        let subtotal_after_discount = round_cents(subtotal - discount_amount);
        let tax = round_cents(subtotal_after_discount * TAX_RATE);
        let total = round_cents(subtotal_after_discount + tax);
        let tip_amount = round_cents(total * tip.percentage() / 100.0);
        let grand_total = round_cents(total + tip_amount);
        Self {
            subtotal,
            discount_amount,
            subtotal_after_discount,
            tax,
            total,
            tip_amount,
            grand_total,
        }
    }

    /// Derive from an order snapshot and optional payment record.
    pub fn for_order(order: &Order, payment: Option<&Payment>, tip: TipSelection) -> Self {
        Self::derive(effective_subtotal(order), payment, tip)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
