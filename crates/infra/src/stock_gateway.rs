//! Inventory adjustment gateway.
//!
//! Approving a variance line creates a stock adjustment that moves the
//! on-hand quantity to the counted quantity. The gateway is the seam to the
//! inventory system that owns stock levels; implementations must be
//! idempotent on `(tenant_id, reference)` so a retried call after a timeout
//! cannot double-apply a delta.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use stocktally_catalog::ProductId;
use stocktally_core::TenantId;

/// Proof that an adjustment was applied (or had already been applied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustmentReceipt {
    pub reference: String,
    pub product_id: ProductId,
    pub delta: i64,
    /// On-hand quantity after the adjustment.
    pub resulting_on_hand: i64,
    pub applied_at: DateTime<Utc>,
    /// True when this call found the adjustment already applied and did
    /// nothing (idempotent replay).
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Error)]
pub enum StockGatewayError {
    /// The inventory system refused the adjustment (permanent).
    #[error("adjustment rejected: {0}")]
    Rejected(String),

    /// The inventory system is unreachable (transient).
    #[error("inventory system unavailable: {0}")]
    Unavailable(String),

    /// The call timed out; the adjustment may or may not have landed.
    #[error("adjustment timed out: {0}")]
    Timeout(String),
}

impl StockGatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

pub trait StockGateway: Send + Sync {
    /// Apply a signed stock delta for a product, keyed by an idempotent
    /// reference. Calling twice with the same reference applies once.
    fn apply_adjustment(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        delta: i64,
        reference: &str,
    ) -> Result<AdjustmentReceipt, StockGatewayError>;
}

impl<G> StockGateway for &G
where
    G: StockGateway + ?Sized,
{
    fn apply_adjustment(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        delta: i64,
        reference: &str,
    ) -> Result<AdjustmentReceipt, StockGatewayError> {
        (**self).apply_adjustment(tenant_id, product_id, delta, reference)
    }
}

impl<G> StockGateway for std::sync::Arc<G>
where
    G: StockGateway + ?Sized,
{
    fn apply_adjustment(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        delta: i64,
        reference: &str,
    ) -> Result<AdjustmentReceipt, StockGatewayError> {
        (**self).apply_adjustment(tenant_id, product_id, delta, reference)
    }
}

/// Retry wrapper for transient gateway failures.
///
/// Safe to wrap around any [`StockGateway`] because the contract already
/// requires idempotency on the reference: retrying after a timeout either
/// applies the delta or deduplicates.
#[derive(Debug, Copy, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts. For tests.
    pub fn no_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        // Exponential, capped.
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug)]
pub struct RetryingStockGateway<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G> RetryingStockGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<G: StockGateway> StockGateway for RetryingStockGateway<G> {
    fn apply_adjustment(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        delta: i64,
        reference: &str,
    ) -> Result<AdjustmentReceipt, StockGatewayError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.inner.apply_adjustment(tenant_id, product_id, delta, reference) {
                Ok(receipt) => return Ok(receipt),
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    tracing::warn!(
                        %tenant_id,
                        reference,
                        attempt,
                        error = %err,
                        "stock adjustment failed, retrying"
                    );
                    let backoff = self.policy.backoff_for(attempt);
                    if !backoff.is_zero() {
                        std::thread::sleep(backoff);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Default)]
struct GatewayState {
    /// On-hand quantity per (tenant, product).
    stock: std::collections::HashMap<(TenantId, ProductId), i64>,
    /// Applied adjustments keyed by (tenant, reference).
    applied: std::collections::HashMap<(TenantId, String), AdjustmentReceipt>,
    /// Transient failures to inject before the next success.
    failures_pending: u32,
    calls: u64,
}

/// In-memory gateway for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryStockGateway {
    state: Mutex<GatewayState>,
}

impl InMemoryStockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_hand(&self, tenant_id: TenantId, product_id: ProductId, qty: i64) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.stock.insert((tenant_id, product_id), qty);
    }

    pub fn on_hand(&self, tenant_id: TenantId, product_id: ProductId) -> Option<i64> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.stock.get(&(tenant_id, product_id)).copied()
    }

    /// Make the next `n` calls fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.failures_pending = n;
    }

    pub fn call_count(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.calls
    }

    pub fn applied_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.applied.len()
    }
}

impl StockGateway for InMemoryStockGateway {
    fn apply_adjustment(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        delta: i64,
        reference: &str,
    ) -> Result<AdjustmentReceipt, StockGatewayError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.calls += 1;

        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(StockGatewayError::Unavailable(
                "injected transient failure".to_string(),
            ));
        }

        let key = (tenant_id, reference.to_string());
        if let Some(existing) = state.applied.get(&key) {
            let mut receipt = existing.clone();
            receipt.deduplicated = true;
            return Ok(receipt);
        }

        let on_hand = state.stock.entry((tenant_id, product_id)).or_insert(0);
        *on_hand += delta;
        let receipt = AdjustmentReceipt {
            reference: reference.to_string(),
            product_id,
            delta,
            resulting_on_hand: *on_hand,
            applied_at: Utc::now(),
            deduplicated: false,
        };
        state.applied.insert(key, receipt.clone());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use stocktally_core::AggregateId;

    use super::*;

    fn ids() -> (TenantId, ProductId) {
        (TenantId::new(), ProductId(AggregateId::new()))
    }

    #[test]
    fn same_reference_applies_once() {
        let gateway = InMemoryStockGateway::new();
        let (tenant_id, product_id) = ids();
        gateway.set_on_hand(tenant_id, product_id, 10);

        let first = gateway
            .apply_adjustment(tenant_id, product_id, -2, "SC-0001/item-1")
            .unwrap();
        let second = gateway
            .apply_adjustment(tenant_id, product_id, -2, "SC-0001/item-1")
            .unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(gateway.on_hand(tenant_id, product_id), Some(8));
        assert_eq!(gateway.applied_count(), 1);
    }

    #[test]
    fn retry_wrapper_recovers_from_transient_failures() {
        let gateway = InMemoryStockGateway::new();
        let (tenant_id, product_id) = ids();
        gateway.set_on_hand(tenant_id, product_id, 5);
        gateway.fail_next(2);

        let retrying = RetryingStockGateway::new(&gateway, RetryPolicy::no_backoff(3));
        let receipt = retrying
            .apply_adjustment(tenant_id, product_id, 3, "SC-0002/item-1")
            .unwrap();

        assert_eq!(receipt.resulting_on_hand, 8);
        assert_eq!(gateway.call_count(), 3);
    }

    #[test]
    fn retry_wrapper_gives_up_after_max_attempts() {
        let gateway = InMemoryStockGateway::new();
        let (tenant_id, product_id) = ids();
        gateway.fail_next(10);

        let retrying = RetryingStockGateway::new(&gateway, RetryPolicy::no_backoff(3));
        let err = retrying
            .apply_adjustment(tenant_id, product_id, 1, "SC-0003/item-1")
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(gateway.call_count(), 3);
    }
}
