//! # Price Catalog
//!
//! AddOrder never trusts a client-supplied price. Each line is priced from a
//! catalog and the name and unit price are frozen onto the line.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::money::Money;

/// What the catalog knows about a product at order time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub unit_price: Money,
}

/// Price lookup, scoped by restaurant.
///
/// Implementations must not block for long: the engine calls this inside an
/// open transaction.
pub trait PriceCatalog: Send + Sync {
    fn lookup(&self, restaurant_id: &str, product_id: &str) -> Option<CatalogEntry>;
}

/// In-memory catalog keyed by `(restaurant_id, product_id)`.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: HashMap<(String, String), CatalogEntry>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a product.
    pub fn with_product(
        mut self,
        restaurant_id: impl Into<String>,
        product_id: impl Into<String>,
        name: impl Into<String>,
        unit_price: Money,
    ) -> Self {
        self.insert(restaurant_id, product_id, name, unit_price);
        self
    }

    pub fn insert(
        &mut self,
        restaurant_id: impl Into<String>,
        product_id: impl Into<String>,
        name: impl Into<String>,
        unit_price: Money,
    ) {
        self.entries.insert(
            (restaurant_id.into(), product_id.into()),
            CatalogEntry {
                name: name.into(),
                unit_price,
            },
        );
    }
}

impl PriceCatalog for StaticCatalog {
    fn lookup(&self, restaurant_id: &str, product_id: &str) -> Option<CatalogEntry> {
        self.entries
            .get(&(restaurant_id.to_string(), product_id.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_scoped_by_restaurant() {
        let catalog =
            StaticCatalog::new().with_product("r1", "burger", "Burger", Money::from_cents(2500));

        let entry = catalog.lookup("r1", "burger").unwrap();
        assert_eq!(entry.name, "Burger");
        assert_eq!(entry.unit_price.cents(), 2500);

        assert!(catalog.lookup("r2", "burger").is_none());
        assert!(catalog.lookup("r1", "pizza").is_none());
    }
}
