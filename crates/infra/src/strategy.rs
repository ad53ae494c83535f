//! Count scope resolution.
//!
//! Turns a count type plus its parameters into the concrete set of line
//! seeds frozen into the schedule event. System quantity and unit cost are
//! captured here, at creation, and never refreshed afterwards.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;

use stocktally_catalog::{CatalogError, CategoryId, ProductCatalog, ProductId, ProductSnapshot};
use stocktally_core::TenantId;
use stocktally_counts::{CountItemId, CountType, LineSeed};

/// Cycle counts pick up products whose last recording is older than this.
pub const CYCLE_LOOKBACK_DAYS: i64 = 30;

/// Spot counts without explicit products sample this share of the catalog.
pub const SPOT_SAMPLE_PERCENT: usize = 10;

/// Caller-supplied scope parameters for one count.
#[derive(Debug, Clone, Default)]
pub struct ScopeRequest {
    pub category_id: Option<CategoryId>,
    /// Explicit product selection (spot counts). Empty means "sample".
    pub product_ids: Vec<ProductId>,
}

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("category counts require a category id")]
    MissingCategory,
}

/// Resolves a count scope against the product catalog.
#[derive(Debug)]
pub struct ScopeResolver<C> {
    catalog: C,
}

impl<C: ProductCatalog> ScopeResolver<C> {
    pub fn new(catalog: C) -> Self {
        Self { catalog }
    }

    /// Resolve the products in scope and freeze them into line seeds.
    ///
    /// `last_counted` answers "when was this product last recorded in any
    /// count" and only matters for cycle counts.
    pub fn resolve(
        &self,
        tenant_id: TenantId,
        count_type: CountType,
        request: &ScopeRequest,
        last_counted: impl Fn(ProductId) -> Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> Result<Vec<LineSeed>, ScopeError> {
        let products = match count_type {
            CountType::Full => self.catalog.active_products(tenant_id)?,
            CountType::Category => {
                let category_id = request.category_id.ok_or(ScopeError::MissingCategory)?;
                self.catalog.products_in_category(tenant_id, category_id)?
            }
            CountType::Spot => {
                if request.product_ids.is_empty() {
                    sample(self.catalog.active_products(tenant_id)?, rng)
                } else {
                    self.catalog.products_by_ids(tenant_id, &request.product_ids)?
                }
            }
            CountType::Cycle => {
                let cutoff = now - Duration::days(CYCLE_LOOKBACK_DAYS);
                self.catalog
                    .active_products(tenant_id)?
                    .into_iter()
                    .filter(|p| match last_counted(p.product_id) {
                        Some(at) => at < cutoff,
                        None => true,
                    })
                    .collect()
            }
        };

        Ok(products.into_iter().map(seed_from).collect())
    }
}

fn seed_from(snapshot: ProductSnapshot) -> LineSeed {
    LineSeed {
        item_id: CountItemId::new(),
        product_id: snapshot.product_id,
        product_name: snapshot.name,
        system_qty: snapshot.on_hand,
        unit_cost: snapshot.unit_cost,
    }
}

/// Random sample of `SPOT_SAMPLE_PERCENT` of the catalog, at least one
/// product when the catalog is non-empty. Output order is re-sorted so a
/// sampled scope still lists deterministically.
fn sample(mut products: Vec<ProductSnapshot>, rng: &mut impl Rng) -> Vec<ProductSnapshot> {
    if products.is_empty() {
        return products;
    }
    let k = (products.len() * SPOT_SAMPLE_PERCENT).div_ceil(100).max(1);
    products.shuffle(rng);
    products.truncate(k);
    products.sort_by_key(|p| *p.product_id.0.as_uuid());
    products
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use stocktally_catalog::InMemoryCatalog;
    use stocktally_core::AggregateId;

    use super::*;

    fn snapshot(name: &str, on_hand: i64) -> ProductSnapshot {
        ProductSnapshot {
            product_id: ProductId(AggregateId::new()),
            name: name.to_string(),
            sku: format!("SKU-{name}"),
            category_id: None,
            active: true,
            on_hand,
            unit_cost: 100,
        }
    }

    fn catalog_with(tenant_id: TenantId, snapshots: &[ProductSnapshot]) -> Arc<InMemoryCatalog> {
        let catalog = Arc::new(InMemoryCatalog::new());
        for s in snapshots {
            catalog.upsert(tenant_id, s.clone());
        }
        catalog
    }

    #[test]
    fn full_scope_takes_every_active_product() {
        let tenant_id = TenantId::new();
        let snapshots = vec![
            snapshot("bolt", 10),
            snapshot("nut", 25),
        ];
        let resolver = ScopeResolver::new(catalog_with(tenant_id, &snapshots));

        let mut rng = StdRng::seed_from_u64(7);
        let seeds = resolver
            .resolve(
                tenant_id,
                CountType::Full,
                &ScopeRequest::default(),
                |_| None,
                Utc::now(),
                &mut rng,
            )
            .unwrap();

        assert_eq!(seeds.len(), 2);
        assert!(seeds.iter().all(|s| s.unit_cost == 100));
    }

    #[test]
    fn category_scope_requires_a_category() {
        let tenant_id = TenantId::new();
        let resolver = ScopeResolver::new(catalog_with(tenant_id, &[]));

        let mut rng = StdRng::seed_from_u64(7);
        let err = resolver
            .resolve(
                tenant_id,
                CountType::Category,
                &ScopeRequest::default(),
                |_| None,
                Utc::now(),
                &mut rng,
            )
            .unwrap_err();

        assert!(matches!(err, ScopeError::MissingCategory));
    }

    #[test]
    fn cycle_scope_skips_recently_counted_products() {
        let tenant_id = TenantId::new();
        let stale = snapshot("stale", 5);
        let fresh = snapshot("fresh", 5);
        let never = snapshot("never", 5);
        let resolver =
            ScopeResolver::new(catalog_with(tenant_id, &[stale.clone(), fresh.clone(), never.clone()]));

        let now = Utc::now();
        let stale_id = stale.product_id;
        let fresh_id = fresh.product_id;
        let mut rng = StdRng::seed_from_u64(7);
        let seeds = resolver
            .resolve(
                tenant_id,
                CountType::Cycle,
                &ScopeRequest::default(),
                |p| {
                    if p == stale_id {
                        Some(now - Duration::days(45))
                    } else if p == fresh_id {
                        Some(now - Duration::days(3))
                    } else {
                        None
                    }
                },
                now,
                &mut rng,
            )
            .unwrap();

        let ids: Vec<ProductId> = seeds.iter().map(|s| s.product_id).collect();
        assert!(ids.contains(&stale_id));
        assert!(!ids.contains(&fresh_id));
        assert!(ids.contains(&never.product_id));
    }

    #[test]
    fn spot_scope_samples_at_least_one_product() {
        let tenant_id = TenantId::new();
        let snapshots: Vec<_> = (0..5)
            .map(|i| snapshot(&format!("p{i}"), 1))
            .collect();
        let resolver = ScopeResolver::new(catalog_with(tenant_id, &snapshots));

        let mut rng = StdRng::seed_from_u64(42);
        let seeds = resolver
            .resolve(
                tenant_id,
                CountType::Spot,
                &ScopeRequest::default(),
                |_| None,
                Utc::now(),
                &mut rng,
            )
            .unwrap();

        assert_eq!(seeds.len(), 1);
    }

    #[test]
    fn spot_scope_honours_explicit_products() {
        let tenant_id = TenantId::new();
        let snapshots: Vec<_> = (0..3)
            .map(|i| snapshot(&format!("p{i}"), 1))
            .collect();
        let resolver = ScopeResolver::new(catalog_with(tenant_id, &snapshots));

        let wanted = vec![snapshots[0].product_id, snapshots[2].product_id];
        let mut rng = StdRng::seed_from_u64(42);
        let seeds = resolver
            .resolve(
                tenant_id,
                CountType::Spot,
                &ScopeRequest {
                    category_id: None,
                    product_ids: wanted.clone(),
                },
                |_| None,
                Utc::now(),
                &mut rng,
            )
            .unwrap();

        let ids: Vec<ProductId> = seeds.iter().map(|s| s.product_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&wanted[0]) && ids.contains(&wanted[1]));
    }
}
