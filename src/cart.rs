//! Local cart store.
//!
//! The cart is client-owned state: lines with price snapshots captured at
//! add-time, persisted to durable storage on every mutation so it survives
//! reloads. Loading is defensive: each stored entry is validated on its
//! own, legacy field spellings are migrated, and entries that satisfy
//! neither schema are dropped with a warning instead of failing the whole
//! cart.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::storage::{keys, Storage};
use crate::totals::round_cents;

// ---------------------------------------------------------------------------
// Cart lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartOption {
    #[serde(alias = "option_id")]
    pub option_id: String,
    #[serde(default, alias = "option_name")]
    pub option_name: String,
    /// Price captured at selection time, never recomputed from the catalog.
    #[serde(default, alias = "price_at_time")]
    pub price_at_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    #[serde(alias = "menu_item_id")]
    pub menu_item_id: String,
    #[serde(default, alias = "menu_item_name")]
    pub menu_item_name: String,
    /// Unit price snapshot at add-time.
    #[serde(default)]
    pub price: f64,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default, alias = "special_request")]
    pub special_request: Option<String>,
    #[serde(default)]
    pub options: Vec<CartOption>,
}

fn default_quantity() -> u32 {
    1
}

impl CartItem {
    /// Line total: `quantity * (price + option prices)`, rounded to cents.
    pub fn line_total(&self) -> f64 {
        let options: f64 = self.options.iter().map(|o| o.price_at_time).sum();
        round_cents(f64::from(self.quantity) * (self.price + options))
    }

    /// Two entries are the same line iff the menu item matches and the
    /// options sequences are deep-equal (order-sensitive).
    fn same_line(&self, other: &CartItem) -> bool {
        self.menu_item_id == other.menu_item_id && self.options == other.options
    }
}

// ---------------------------------------------------------------------------
// Legacy schema migration
// ---------------------------------------------------------------------------

/// Decode one stored entry: current schema first, then the legacy field
/// spelling (`item_id`/`item_name`/`qty`, options as `{id, name, price}`).
/// Entries that resolve no menu item id are dropped.
fn decode_entry(entry: &Value) -> Option<CartItem> {
    if let Ok(item) = serde_json::from_value::<CartItem>(entry.clone()) {
        if !item.menu_item_id.trim().is_empty() {
            return Some(item);
        }
    }

    let id = entry
        .get("item_id")
        .or_else(|| entry.get("itemId"))
        .or_else(|| entry.get("id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())?;

    let name = entry
        .get("item_name")
        .or_else(|| entry.get("itemName"))
        .or_else(|| entry.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let price = entry
        .get("price")
        .or_else(|| entry.get("unit_price"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let quantity = entry
        .get("qty")
        .or_else(|| entry.get("quantity"))
        .and_then(Value::as_u64)
        .and_then(|q| u32::try_from(q).ok())
        .filter(|q| *q >= 1)
        .unwrap_or(1);
    let special_request = entry
        .get("special_request")
        .or_else(|| entry.get("note"))
        .and_then(Value::as_str)
        .map(String::from);

    let options = entry
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .filter_map(|o| {
                    let option_id = o
                        .get("id")
                        .or_else(|| o.get("option_id"))
                        .and_then(Value::as_str)?;
                    Some(CartOption {
                        option_id: option_id.to_string(),
                        option_name: o
                            .get("name")
                            .or_else(|| o.get("option_name"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        price_at_time: o
                            .get("price")
                            .or_else(|| o.get("price_at_time"))
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    debug!(menu_item_id = id, "migrated legacy cart entry");
    Some(CartItem {
        menu_item_id: id.to_string(),
        menu_item_name: name.to_string(),
        price,
        quantity,
        special_request,
        options,
    })
}

// ---------------------------------------------------------------------------
// Cart store
// ---------------------------------------------------------------------------

/// Client-persisted cart. Every mutation writes through to storage;
/// totals are recomputed on every read, never cached.
pub struct CartStore {
    storage: Arc<Storage>,
    items: Mutex<Vec<CartItem>>,
}

impl CartStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CartItem>> {
        // A poisoned lock only means a panic mid-mutation; the data is
        // still the last persisted state.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the cart from storage. An unparsable payload resets to empty
    /// (the storage layer wipes the corrupt record); individual bad entries
    /// are dropped with a warning.
    pub fn load(storage: Arc<Storage>) -> Self {
        let mut items = Vec::new();
        if let Some(value) = storage.get_record(keys::CART) {
            match value {
                Value::Array(entries) => {
                    for entry in &entries {
                        match decode_entry(entry) {
                            Some(item) => items.push(item),
                            None => warn!("dropping unmigratable cart entry"),
                        }
                    }
                }
                other => {
                    warn!("cart record is not an array ({other}), resetting");
                    let _ = storage.remove_record(keys::CART);
                }
            }
        }
        Self {
            storage,
            items: Mutex::new(items),
        }
    }

    fn persist(&self, items: &[CartItem]) {
        if let Err(e) = self.storage.set_typed(keys::CART, &items) {
            warn!("failed to persist cart: {e}");
        }
    }

    /// Add an item: merge into an existing line when the menu item and the
    /// options sequence both match, otherwise append a new line.
    pub fn add_item(&self, item: CartItem) {
        let mut items = self.lock();
        match items.iter_mut().find(|line| line.same_line(&item)) {
            Some(line) => line.quantity += item.quantity,
            None => items.push(item),
        }
        self.persist(&items);
    }

    /// Set the quantity for every line of a menu item; zero or negative
    /// removes them. Keys by `menu_item_id` alone, so all option-variants
    /// of the item are affected at once.
    pub fn update_quantity(&self, menu_item_id: &str, quantity: i64) {
        let mut items = self.lock();
        if quantity <= 0 {
            items.retain(|line| line.menu_item_id != menu_item_id);
        } else {
            let quantity = u32::try_from(quantity).unwrap_or(u32::MAX);
            for line in items.iter_mut().filter(|l| l.menu_item_id == menu_item_id) {
                line.quantity = quantity;
            }
        }
        self.persist(&items);
    }

    /// Remove every line whose `menu_item_id` matches.
    pub fn remove_item(&self, menu_item_id: &str) {
        let mut items = self.lock();
        items.retain(|line| line.menu_item_id != menu_item_id);
        self.persist(&items);
    }

    /// Empty the cart (called after successful order placement).
    pub fn clear(&self) {
        let mut items = self.lock();
        items.clear();
        self.persist(&items);
    }

    /// Snapshot of the current lines.
    pub fn items(&self) -> Vec<CartItem> {
        self.lock().clone()
    }

    /// Total price across all lines, recomputed on every call.
    pub fn total_price(&self) -> f64 {
        let items = self.lock();
        round_cents(items.iter().map(CartItem::line_total).sum())
    }

    /// Total unit count across all lines.
    pub fn item_count(&self) -> u32 {
        let items = self.lock();
        items.iter().map(|l| l.quantity).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
