//! Order progress derivation.
//!
//! A pure function of the order snapshot: per-order progress is the
//! minimum milestone every non-rejected item has reached, and terminal or
//! payment order statuses override the item-derived display. No state is
//! kept here; the next fetch simply re-derives.

use serde::Serialize;

use crate::model::{Order, OrderItemStatus, OrderStatus};

/// Progress milestones shown to the guest.
pub const STEP_RECEIVED: u8 = 0;
pub const STEP_PREPARING: u8 = 1;
pub const STEP_READY: u8 = 2;
pub const STEP_ALL_SERVED: u8 = 3;

/// What the tracking view displays for the order as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    Received,
    Preparing,
    Ready,
    Served,
    PaymentPending,
    Completed,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderProgress {
    pub step_index: u8,
    pub display_status: DisplayStatus,
}

fn reached(status: OrderItemStatus, milestone: u8) -> bool {
    use OrderItemStatus::*;
    match milestone {
        STEP_ALL_SERVED => matches!(status, Served),
        STEP_READY => matches!(status, Ready | Served),
        STEP_PREPARING => matches!(status, Accepted | Preparing | Ready | Served),
        _ => true,
    }
}

/// Derive the guest-facing progress for an order.
///
/// Rejected items are excluded entirely. The step index is the highest
/// milestone satisfied by ALL remaining items; an order with no remaining
/// items stays at the first step (its display is governed by the order
/// status).
pub fn derive_progress(order: &Order) -> OrderProgress {
    let statuses: Vec<OrderItemStatus> = order.active_items().map(|i| i.status).collect();

    let step_index = if statuses.is_empty() {
        STEP_RECEIVED
    } else {
        let mut step = STEP_RECEIVED;
        for milestone in [STEP_PREPARING, STEP_READY, STEP_ALL_SERVED] {
            if statuses.iter().all(|s| reached(*s, milestone)) {
                step = milestone;
            } else {
                break;
            }
        }
        step
    };

    let item_display = match step_index {
        STEP_ALL_SERVED => DisplayStatus::Served,
        STEP_READY => DisplayStatus::Ready,
        STEP_PREPARING => DisplayStatus::Preparing,
        _ => DisplayStatus::Received,
    };

    // Terminal and payment states take display precedence over item progress.
    let display_status = match order.status {
        OrderStatus::PaymentPending => DisplayStatus::PaymentPending,
        OrderStatus::Completed => DisplayStatus::Completed,
        OrderStatus::Cancelled => DisplayStatus::Cancelled,
        OrderStatus::Rejected => DisplayStatus::Rejected,
        _ => item_display,
    };

    OrderProgress {
        step_index,
        display_status,
    }
}

/// The bill can be requested iff at least one item survived rejection and
/// every surviving item has been served.
pub fn can_request_bill(order: &Order) -> bool {
    let mut any = false;
    for item in order.active_items() {
        any = true;
        if item.status != OrderItemStatus::Served {
            return false;
        }
    }
    any
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order(status: &str, item_statuses: &[&str]) -> Order {
        let items: Vec<_> = item_statuses
            .iter()
            .enumerate()
            .map(|(i, s)| {
                json!({
                    "id": format!("oi-{i}"),
                    "menuItemId": format!("m-{i}"),
                    "quantity": 1,
                    "unitPrice": 5.0,
                    "status": s,
                })
            })
            .collect();
        serde_json::from_value(json!({
            "id": "ord-1",
            "status": status,
            "orderItems": items,
        }))
        .unwrap()
    }

    #[test]
    fn test_step_is_minimum_milestone() {
        assert_eq!(
            derive_progress(&order("active", &["pending", "served"])).step_index,
            STEP_RECEIVED
        );
        assert_eq!(
            derive_progress(&order("active", &["accepted", "preparing"])).step_index,
            STEP_PREPARING
        );
        assert_eq!(
            derive_progress(&order("active", &["ready", "served"])).step_index,
            STEP_READY
        );
        assert_eq!(
            derive_progress(&order("active", &["served", "served"])).step_index,
            STEP_ALL_SERVED
        );
    }

    #[test]
    fn test_step_monotone_as_items_advance() {
        // Walk one item through the pipeline while the other stays served;
        // the step must never move backwards.
        let path = ["pending", "accepted", "preparing", "ready", "served"];
        let mut last = 0;
        for status in path {
            let step = derive_progress(&order("active", &[status, "served"])).step_index;
            assert!(step >= last, "step went backwards at {status}");
            last = step;
        }
        assert_eq!(last, STEP_ALL_SERVED);
    }

    #[test]
    fn test_rejected_items_excluded() {
        let progress = derive_progress(&order("active", &["served", "rejected"]));
        assert_eq!(progress.step_index, STEP_ALL_SERVED);
        assert_eq!(progress.display_status, DisplayStatus::Served);
    }

    #[test]
    fn test_all_rejected_stays_at_first_step() {
        let progress = derive_progress(&order("rejected", &["rejected", "rejected"]));
        assert_eq!(progress.step_index, STEP_RECEIVED);
        assert_eq!(progress.display_status, DisplayStatus::Rejected);
    }

    #[test]
    fn test_order_status_overrides_display() {
        let progress = derive_progress(&order("payment_pending", &["served", "served"]));
        assert_eq!(progress.step_index, STEP_ALL_SERVED);
        assert_eq!(progress.display_status, DisplayStatus::PaymentPending);

        let progress = derive_progress(&order("cancelled", &["preparing"]));
        assert_eq!(progress.display_status, DisplayStatus::Cancelled);

        // Active status does not override item-derived display
        let progress = derive_progress(&order("active", &["ready"]));
        assert_eq!(progress.display_status, DisplayStatus::Ready);
    }

    #[test]
    fn test_can_request_bill() {
        assert!(can_request_bill(&order("active", &["served", "served"])));
        assert!(can_request_bill(&order("active", &["served", "rejected"])));
        assert!(!can_request_bill(&order("active", &["served", "ready"])));
        assert!(!can_request_bill(&order("active", &[])));
        assert!(!can_request_bill(&order("active", &["rejected"])));
    }
}
