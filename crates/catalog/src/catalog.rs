use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stocktally_core::{AggregateId, TenantId};

/// Product identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Category identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryId(pub AggregateId);

impl CategoryId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for CategoryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Point-in-time view of a product as the catalog reports it.
///
/// `on_hand` and `unit_cost` become the immutable `system_qty`/`unit_cost`
/// snapshot on the count line; they are read here once and never refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub product_id: ProductId,
    pub name: String,
    pub sku: String,
    pub category_id: Option<CategoryId>,
    pub active: bool,
    /// Current system quantity on hand.
    pub on_hand: i64,
    /// Unit cost in smallest currency unit (e.g., cents).
    pub unit_cost: u64,
}

/// Catalog lookup failure.
///
/// The catalog is assumed reliable but fallible; failures are surfaced to
/// the caller rather than retried here (count creation is cheap to retry).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("unknown product: {0}")]
    UnknownProduct(ProductId),

    #[error("unknown category: {0}")]
    UnknownCategory(CategoryId),

    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Read-only product/category catalog contract.
///
/// Resolves the product set and system quantities for a count at creation
/// time. Implementations must be tenant-isolated.
pub trait ProductCatalog: Send + Sync {
    /// All active products for a tenant (full-count strategy).
    fn active_products(&self, tenant_id: TenantId) -> Result<Vec<ProductSnapshot>, CatalogError>;

    /// All active products in one category (category-count strategy).
    fn products_in_category(
        &self,
        tenant_id: TenantId,
        category_id: CategoryId,
    ) -> Result<Vec<ProductSnapshot>, CatalogError>;

    /// Resolve an explicit product list (spot-check strategy).
    ///
    /// Fails with `UnknownProduct` on the first id that does not resolve.
    fn products_by_ids(
        &self,
        tenant_id: TenantId,
        ids: &[ProductId],
    ) -> Result<Vec<ProductSnapshot>, CatalogError>;
}

impl<C> ProductCatalog for std::sync::Arc<C>
where
    C: ProductCatalog + ?Sized,
{
    fn active_products(&self, tenant_id: TenantId) -> Result<Vec<ProductSnapshot>, CatalogError> {
        (**self).active_products(tenant_id)
    }

    fn products_in_category(
        &self,
        tenant_id: TenantId,
        category_id: CategoryId,
    ) -> Result<Vec<ProductSnapshot>, CatalogError> {
        (**self).products_in_category(tenant_id, category_id)
    }

    fn products_by_ids(
        &self,
        tenant_id: TenantId,
        ids: &[ProductId],
    ) -> Result<Vec<ProductSnapshot>, CatalogError> {
        (**self).products_by_ids(tenant_id, ids)
    }
}

/// In-memory catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: RwLock<HashMap<(TenantId, ProductId), ProductSnapshot>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, tenant_id: TenantId, snapshot: ProductSnapshot) {
        if let Ok(mut map) = self.products.write() {
            map.insert((tenant_id, snapshot.product_id), snapshot);
        }
    }

    fn list(&self, tenant_id: TenantId) -> Vec<ProductSnapshot> {
        let map = match self.products.read() {
            Ok(m) => m,
            Err(_) => return vec![],
        };

        let mut out: Vec<ProductSnapshot> = map
            .iter()
            .filter_map(|((t, _), v)| (*t == tenant_id).then(|| v.clone()))
            .collect();
        // Deterministic order for tests and sampling.
        out.sort_by_key(|p| *p.product_id.0.as_uuid());
        out
    }
}

impl ProductCatalog for InMemoryCatalog {
    fn active_products(&self, tenant_id: TenantId) -> Result<Vec<ProductSnapshot>, CatalogError> {
        Ok(self
            .list(tenant_id)
            .into_iter()
            .filter(|p| p.active)
            .collect())
    }

    fn products_in_category(
        &self,
        tenant_id: TenantId,
        category_id: CategoryId,
    ) -> Result<Vec<ProductSnapshot>, CatalogError> {
        Ok(self
            .list(tenant_id)
            .into_iter()
            .filter(|p| p.active && p.category_id == Some(category_id))
            .collect())
    }

    fn products_by_ids(
        &self,
        tenant_id: TenantId,
        ids: &[ProductId],
    ) -> Result<Vec<ProductSnapshot>, CatalogError> {
        let map = self
            .products
            .read()
            .map_err(|_| CatalogError::Unavailable("lock poisoned".to_string()))?;

        ids.iter()
            .map(|id| {
                map.get(&(tenant_id, *id))
                    .cloned()
                    .ok_or(CatalogError::UnknownProduct(*id))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(product_id: ProductId, category: Option<CategoryId>, active: bool) -> ProductSnapshot {
        ProductSnapshot {
            product_id,
            name: "Widget".to_string(),
            sku: "W-1".to_string(),
            category_id: category,
            active,
            on_hand: 10,
            unit_cost: 250,
        }
    }

    #[test]
    fn active_products_excludes_inactive() {
        let tenant = TenantId::new();
        let catalog = InMemoryCatalog::new();
        let live = ProductId::new(AggregateId::new());
        let dead = ProductId::new(AggregateId::new());
        catalog.upsert(tenant, snapshot(live, None, true));
        catalog.upsert(tenant, snapshot(dead, None, false));

        let found = catalog.active_products(tenant).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].product_id, live);
    }

    #[test]
    fn products_by_ids_reports_first_unknown() {
        let tenant = TenantId::new();
        let catalog = InMemoryCatalog::new();
        let known = ProductId::new(AggregateId::new());
        let unknown = ProductId::new(AggregateId::new());
        catalog.upsert(tenant, snapshot(known, None, true));

        let err = catalog.products_by_ids(tenant, &[known, unknown]).unwrap_err();
        assert_eq!(err, CatalogError::UnknownProduct(unknown));
    }

    #[test]
    fn tenants_are_isolated() {
        let a = TenantId::new();
        let b = TenantId::new();
        let catalog = InMemoryCatalog::new();
        catalog.upsert(a, snapshot(ProductId::new(AggregateId::new()), None, true));

        assert!(catalog.active_products(b).unwrap().is_empty());
    }
}
