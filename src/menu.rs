//! Guest menu access.
//!
//! The menu is backend-owned; this is a thin fetch with an in-process
//! cache so browsing does not refetch on every screen. Readers return the
//! cached data (empty on miss) and callers refresh explicitly.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

use crate::api::ApiClient;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuModifier {
    pub id: String,
    #[serde(default, alias = "option_name", alias = "name")]
    pub option_name: String,
    #[serde(default)]
    pub price: f64,
    /// Whether the guest must pick this modifier before adding to cart.
    #[serde(default, alias = "is_required")]
    pub is_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default = "default_available", alias = "is_available")]
    pub is_available: bool,
    #[serde(default)]
    pub modifiers: Vec<MenuModifier>,
}

fn default_available() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuCategory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub items: Vec<MenuItem>,
}

/// In-process menu cache.
#[derive(Default)]
pub struct MenuCache {
    categories: Mutex<Vec<MenuCategory>>,
}

impl MenuCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached categories; empty until the first refresh.
    pub fn categories(&self) -> Vec<MenuCategory> {
        self.categories
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Find an item across categories.
    pub fn find_item(&self, menu_item_id: &str) -> Option<MenuItem> {
        self.categories()
            .into_iter()
            .flat_map(|c| c.items)
            .find(|i| i.id == menu_item_id)
    }

    /// Fetch the guest menu and replace the cache.
    pub async fn refresh(&self, api: &ApiClient) -> Result<usize> {
        let data = api.get("/menu/guest").await?;
        let categories: Vec<MenuCategory> = serde_json::from_value(data)
            .map_err(|e| Error::Transport(format!("Invalid menu payload: {e}")))?;
        let count = categories.iter().map(|c| c.items.len()).sum();
        if let Ok(mut cache) = self.categories.lock() {
            *cache = categories;
        }
        info!(items = count, "menu refreshed");
        Ok(count)
    }
}

/// Required modifiers the guest has not picked yet. Checked before the
/// item goes into the cart, so no network call is made for an invalid
/// selection.
pub fn missing_required_modifiers<'a>(
    item: &'a MenuItem,
    selected_option_ids: &[&str],
) -> Vec<&'a MenuModifier> {
    item.modifiers
        .iter()
        .filter(|m| m.is_required && !selected_option_ids.contains(&m.id.as_str()))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_menu_parses_with_defaults() {
        let category: MenuCategory = serde_json::from_value(serde_json::json!({
            "id": "c-1",
            "name": "Grill",
            "items": [{
                "id": "m-1",
                "name": "Gyros",
                "price": 8.5,
                "modifiers": [{"id": "o-1", "name": "Extra pita", "price": 0.5, "is_required": false}],
            }],
        }))
        .unwrap();
        assert!(category.items[0].is_available);
        assert_eq!(category.items[0].modifiers[0].option_name, "Extra pita");
    }

    #[test]
    fn test_missing_required_modifiers() {
        let item: MenuItem = serde_json::from_value(serde_json::json!({
            "id": "m-1",
            "name": "Burger",
            "price": 9.0,
            "modifiers": [
                {"id": "o-1", "name": "Doneness", "price": 0.0, "isRequired": true},
                {"id": "o-2", "name": "Extra cheese", "price": 1.0, "isRequired": false},
            ],
        }))
        .unwrap();
        let missing = missing_required_modifiers(&item, &[]);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, "o-1");
        assert!(missing_required_modifiers(&item, &["o-1"]).is_empty());
    }

    #[test]
    fn test_find_item() {
        let cache = MenuCache::new();
        *cache.categories.lock().unwrap() = vec![MenuCategory {
            id: "c-1".into(),
            name: "Grill".into(),
            items: vec![MenuItem {
                id: "m-1".into(),
                name: "Gyros".into(),
                description: None,
                price: 8.5,
                is_available: true,
                modifiers: vec![],
            }],
        }];
        assert_eq!(cache.find_item("m-1").unwrap().name, "Gyros");
        assert!(cache.find_item("m-2").is_none());
    }
}
