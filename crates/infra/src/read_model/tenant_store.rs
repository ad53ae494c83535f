use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use stocktally_core::TenantId;

/// Tenant-partitioned key/value storage for derived views.
///
/// Every operation is scoped to a tenant; there is no way to read or write
/// across tenants through this trait. `purge_tenant` exists for rebuilds:
/// drop the tenant's records, replay the stream, done.
pub trait TenantStore<K, V>: Send + Sync {
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V>;

    fn put(&self, tenant_id: TenantId, key: K, value: V);

    fn remove(&self, tenant_id: TenantId, key: &K);

    /// All values for a tenant, in no particular order.
    fn list(&self, tenant_id: TenantId) -> Vec<V>;

    fn purge_tenant(&self, tenant_id: TenantId);
}

impl<K, V, S> TenantStore<K, V> for Arc<S>
where
    S: TenantStore<K, V> + ?Sized,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V> {
        (**self).get(tenant_id, key)
    }

    fn put(&self, tenant_id: TenantId, key: K, value: V) {
        (**self).put(tenant_id, key, value)
    }

    fn remove(&self, tenant_id: TenantId, key: &K) {
        (**self).remove(tenant_id, key)
    }

    fn list(&self, tenant_id: TenantId) -> Vec<V> {
        (**self).list(tenant_id)
    }

    fn purge_tenant(&self, tenant_id: TenantId) {
        (**self).purge_tenant(tenant_id)
    }
}

/// Heap-backed store, one map per tenant.
#[derive(Debug)]
pub struct InMemoryTenantStore<K, V> {
    tenants: RwLock<HashMap<TenantId, HashMap<K, V>>>,
}

impl<K, V> InMemoryTenantStore<K, V> {
    pub fn new() -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryTenantStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TenantStore<K, V> for InMemoryTenantStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V> {
        let tenants = self.tenants.read().ok()?;
        tenants.get(&tenant_id)?.get(key).cloned()
    }

    fn put(&self, tenant_id: TenantId, key: K, value: V) {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.entry(tenant_id).or_default().insert(key, value);
        }
    }

    fn remove(&self, tenant_id: TenantId, key: &K) {
        if let Ok(mut tenants) = self.tenants.write() {
            if let Some(records) = tenants.get_mut(&tenant_id) {
                records.remove(key);
            }
        }
    }

    fn list(&self, tenant_id: TenantId) -> Vec<V> {
        let tenants = match self.tenants.read() {
            Ok(t) => t,
            Err(_) => return vec![],
        };

        tenants
            .get(&tenant_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    fn purge_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.remove(&tenant_id);
        }
    }
}
