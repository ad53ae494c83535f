use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stocktally_catalog::{CategoryId, ProductId};
use stocktally_core::{AggregateId, TenantId, UserId};
use stocktally_counts::{
    CategoryTally, CountEvent, CountId, CountItemId, CountStatus, CountType, Variance,
    VarianceCategory,
};
use stocktally_events::EventEnvelope;

use crate::read_model::TenantStore;

/// Everything the projection knows about one line of a count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFacts {
    pub item_id: CountItemId,
    pub product_id: ProductId,
    pub product_name: String,
    pub system_qty: i64,
    pub unit_cost: u64,
    pub counted_qty: Option<i64>,
    pub variance: Option<Variance>,
    pub variance_category: Option<VarianceCategory>,
    pub approved: bool,
    pub adjustment_reference: Option<String>,
    pub last_counted_at: Option<DateTime<Utc>>,
}

impl LineFacts {
    pub fn is_counted(&self) -> bool {
        self.counted_qty.is_some()
    }
}

/// Per-count record held by the projection. Raw facts only; the rollup in
/// [`CountOverview`] is derived at query time so an update never has to
/// patch aggregated numbers incrementally.
#[derive(Debug, Clone, PartialEq)]
pub struct CountFacts {
    pub count_id: CountId,
    pub sequence_no: String,
    pub count_type: CountType,
    pub status: CountStatus,
    pub blind: bool,
    pub count_date: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub category_id: Option<CategoryId>,
    pub assigned_to: Option<UserId>,
    pub scheduled_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lines: HashMap<CountItemId, LineFacts>,
}

impl CountFacts {
    pub fn overview(&self) -> CountOverview {
        let total_items = self.lines.len();
        let mut counted_items = 0usize;
        let mut approved_items = 0usize;
        let mut items_with_variance = 0usize;
        let mut total_variance_value = 0i64;
        let mut by_category = CategoryTally::default();

        for line in self.lines.values() {
            if line.approved {
                approved_items += 1;
            }
            let Some(variance) = line.variance else {
                continue;
            };
            counted_items += 1;
            total_variance_value = total_variance_value.saturating_add(variance.value);
            if !variance.is_zero() {
                items_with_variance += 1;
                match line.variance_category {
                    Some(VarianceCategory::Minor) => by_category.minor += 1,
                    Some(VarianceCategory::Moderate) => by_category.moderate += 1,
                    Some(VarianceCategory::Major) => by_category.major += 1,
                    None => {}
                }
            }
        }

        let progress_percent = if total_items == 0 {
            0.0
        } else {
            counted_items as f64 * 100.0 / total_items as f64
        };
        // Same formula as `CountSummary`: uncounted lines have not varied,
        // so an in-flight count reads high and only falls as variances land.
        let accuracy_percent = if total_items == 0 {
            100.0
        } else {
            (total_items - items_with_variance) as f64 * 100.0 / total_items as f64
        };

        CountOverview {
            count_id: self.count_id,
            sequence_no: self.sequence_no.clone(),
            count_type: self.count_type,
            status: self.status,
            blind: self.blind,
            count_date: self.count_date,
            deadline: self.deadline,
            assigned_to: self.assigned_to,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            total_items,
            counted_items,
            approved_items,
            items_with_variance,
            total_variance_value,
            progress_percent,
            accuracy_percent,
            by_category,
        }
    }
}

/// Read model: one row per count for listings and dashboards.
#[derive(Debug, Clone, PartialEq)]
pub struct CountOverview {
    pub count_id: CountId,
    pub sequence_no: String,
    pub count_type: CountType,
    pub status: CountStatus,
    pub blind: bool,
    pub count_date: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub assigned_to: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_items: usize,
    pub counted_items: usize,
    pub approved_items: usize,
    pub items_with_variance: usize,
    pub total_variance_value: i64,
    pub progress_percent: f64,
    pub accuracy_percent: f64,
    pub by_category: CategoryTally,
}

#[derive(Debug, Error)]
pub enum CountProjectionError {
    #[error("failed to deserialize count event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("event for unknown count {0}")]
    UnknownCount(CountId),
}

/// Tenant+aggregate cursor for idempotent application.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

/// Projection: count event streams → [`CountFacts`] per count plus a
/// per-product last-counted index (feeds cycle count scheduling).
#[derive(Debug)]
pub struct CountOverviewProjection<S>
where
    S: TenantStore<CountId, CountFacts>,
{
    store: S,
    cursors: RwLock<HashMap<CursorKey, u64>>,
    last_counted: RwLock<HashMap<(TenantId, ProductId), DateTime<Utc>>>,
}

impl<S> CountOverviewProjection<S>
where
    S: TenantStore<CountId, CountFacts>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
            last_counted: RwLock::new(HashMap::new()),
        }
    }

    /// Apply one committed envelope. Duplicates (same or older sequence
    /// number) are skipped, so at-least-once delivery is safe.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), CountProjectionError> {
        let tenant_id = envelope.tenant_id;
        let key = CursorKey {
            tenant_id,
            aggregate_id: envelope.aggregate_id,
        };

        {
            let cursors = self
                .cursors
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(&last) = cursors.get(&key) {
                if envelope.sequence_number <= last {
                    return Ok(());
                }
            }
        }

        let event: CountEvent = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| CountProjectionError::Deserialize(e.to_string()))?;

        if event_tenant(&event) != tenant_id {
            return Err(CountProjectionError::TenantIsolation(format!(
                "envelope tenant {} does not match event tenant {}",
                tenant_id,
                event_tenant(&event)
            )));
        }

        self.apply_event(tenant_id, &event)?;

        let mut cursors = self
            .cursors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cursors.insert(key, envelope.sequence_number);
        Ok(())
    }

    /// Drop all derived state for a tenant and replay the given envelopes.
    pub fn rebuild(
        &self,
        tenant_id: TenantId,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), CountProjectionError> {
        self.store.purge_tenant(tenant_id);
        {
            let mut cursors = self
                .cursors
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cursors.retain(|k, _| k.tenant_id != tenant_id);
        }
        {
            let mut last = self
                .last_counted
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            last.retain(|(t, _), _| *t != tenant_id);
        }

        for envelope in envelopes {
            self.apply_envelope(&envelope)?;
        }
        Ok(())
    }

    pub fn facts(&self, tenant_id: TenantId, count_id: CountId) -> Option<CountFacts> {
        self.store.get(tenant_id, &count_id)
    }

    pub fn overview(&self, tenant_id: TenantId, count_id: CountId) -> Option<CountOverview> {
        self.facts(tenant_id, count_id).map(|f| f.overview())
    }

    pub fn list(&self, tenant_id: TenantId) -> Vec<CountOverview> {
        let mut rows: Vec<CountOverview> = self
            .store
            .list(tenant_id)
            .iter()
            .map(CountFacts::overview)
            .collect();
        // Stable listing order: newest first, id as tiebreaker.
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.count_id.0.as_uuid().cmp(&a.count_id.0.as_uuid()))
        });
        rows
    }

    pub fn count_rows(&self, tenant_id: TenantId) -> usize {
        self.store.list(tenant_id).len()
    }

    /// When this product was last recorded in any count, if ever.
    pub fn last_counted(&self, tenant_id: TenantId, product_id: ProductId) -> Option<DateTime<Utc>> {
        let last = self
            .last_counted
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last.get(&(tenant_id, product_id)).copied()
    }

    fn apply_event(&self, tenant_id: TenantId, event: &CountEvent) -> Result<(), CountProjectionError> {
        match event {
            CountEvent::CountScheduled(e) => {
                let lines = e
                    .lines
                    .iter()
                    .map(|seed| {
                        (
                            seed.item_id,
                            LineFacts {
                                item_id: seed.item_id,
                                product_id: seed.product_id,
                                product_name: seed.product_name.clone(),
                                system_qty: seed.system_qty,
                                unit_cost: seed.unit_cost,
                                counted_qty: None,
                                variance: None,
                                variance_category: None,
                                approved: false,
                                adjustment_reference: None,
                                last_counted_at: None,
                            },
                        )
                    })
                    .collect();

                let facts = CountFacts {
                    count_id: e.count_id,
                    sequence_no: e.sequence_no.clone(),
                    count_type: e.count_type,
                    status: CountStatus::Draft,
                    blind: e.blind,
                    count_date: e.count_date,
                    deadline: e.deadline,
                    category_id: e.category_id,
                    assigned_to: e.assigned_to,
                    scheduled_by: e.scheduled_by,
                    created_at: e.occurred_at,
                    updated_at: e.occurred_at,
                    completed_at: None,
                    lines,
                };
                self.store.put(tenant_id, e.count_id, facts);
                Ok(())
            }
            CountEvent::CountStarted(e)
            | CountEvent::CountSubmitted(e)
            | CountEvent::CountReopened(e)
            | CountEvent::CountCancelled(e)
            | CountEvent::CountApproved(e)
            | CountEvent::CountCompleted(e) => {
                self.update_facts(tenant_id, e.count_id, |facts| {
                    facts.status = e.to;
                    facts.updated_at = e.occurred_at;
                    if e.to == CountStatus::Completed {
                        facts.completed_at = Some(e.occurred_at);
                    }
                })
            }
            CountEvent::LineRecorded(e) => {
                {
                    let mut last = self
                        .last_counted
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let slot = last.entry((tenant_id, e.product_id)).or_insert(e.occurred_at);
                    if e.occurred_at > *slot {
                        *slot = e.occurred_at;
                    }
                }
                self.update_facts(tenant_id, e.count_id, |facts| {
                    facts.updated_at = e.occurred_at;
                    if let Some(line) = facts.lines.get_mut(&e.item_id) {
                        line.counted_qty = Some(e.counted_qty);
                        line.variance = Some(e.variance);
                        line.variance_category = Some(e.variance_category);
                        line.last_counted_at = Some(e.occurred_at);
                    }
                })
            }
            CountEvent::LineApproved(e) => self.update_facts(tenant_id, e.count_id, |facts| {
                facts.updated_at = e.occurred_at;
                if let Some(line) = facts.lines.get_mut(&e.item_id) {
                    line.approved = true;
                    line.adjustment_reference = e.adjustment_reference.clone();
                }
            }),
        }
    }

    fn update_facts(
        &self,
        tenant_id: TenantId,
        count_id: CountId,
        mutate: impl FnOnce(&mut CountFacts),
    ) -> Result<(), CountProjectionError> {
        let mut facts = self
            .store
            .get(tenant_id, &count_id)
            .ok_or(CountProjectionError::UnknownCount(count_id))?;
        mutate(&mut facts);
        self.store.put(tenant_id, count_id, facts);
        Ok(())
    }
}

fn event_tenant(event: &CountEvent) -> TenantId {
    match event {
        CountEvent::CountScheduled(e) => e.tenant_id,
        CountEvent::CountStarted(e)
        | CountEvent::CountSubmitted(e)
        | CountEvent::CountReopened(e)
        | CountEvent::CountCancelled(e)
        | CountEvent::CountApproved(e)
        | CountEvent::CountCompleted(e) => e.tenant_id,
        CountEvent::LineRecorded(e) => e.tenant_id,
        CountEvent::LineApproved(e) => e.tenant_id,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use stocktally_counts::{compute_variance, CountScheduled, LineRecorded, LineSeed, VariancePolicy};
    use stocktally_events::Event;

    use super::*;
    use crate::read_model::InMemoryTenantStore;

    fn projection() -> CountOverviewProjection<Arc<InMemoryTenantStore<CountId, CountFacts>>> {
        CountOverviewProjection::new(Arc::new(InMemoryTenantStore::new()))
    }

    fn envelope(
        tenant_id: TenantId,
        count_id: CountId,
        sequence_number: u64,
        event: &CountEvent,
    ) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            count_id.0,
            "stock_count".to_string(),
            sequence_number,
            serde_json::to_value(event).unwrap(),
        )
    }

    fn scheduled(tenant_id: TenantId, count_id: CountId, seeds: Vec<LineSeed>) -> CountEvent {
        CountEvent::CountScheduled(CountScheduled {
            tenant_id,
            count_id,
            sequence_no: "SC-0001".to_string(),
            count_type: CountType::Full,
            blind: false,
            count_date: Utc::now(),
            deadline: None,
            category_id: None,
            assigned_to: None,
            notes: None,
            lines: seeds,
            scheduled_by: UserId::new(),
            occurred_at: Utc::now(),
        })
    }

    fn seed(system_qty: i64, unit_cost: u64) -> LineSeed {
        LineSeed {
            item_id: CountItemId::new(),
            product_id: ProductId(AggregateId::new()),
            product_name: "Widget".to_string(),
            system_qty,
            unit_cost,
        }
    }

    fn recorded(
        tenant_id: TenantId,
        count_id: CountId,
        seed: &LineSeed,
        counted_qty: i64,
    ) -> CountEvent {
        let variance = compute_variance(seed.system_qty, counted_qty, seed.unit_cost);
        let category = VariancePolicy::default().classify(variance.percent_bp);
        CountEvent::LineRecorded(LineRecorded {
            tenant_id,
            count_id,
            item_id: seed.item_id,
            product_id: seed.product_id,
            counted_qty,
            previous_qty: None,
            variance,
            variance_category: category,
            condition: Default::default(),
            count_method: "manual".to_string(),
            notes: None,
            counter: UserId::new(),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn overview_reflects_recorded_lines() {
        let projection = projection();
        let tenant_id = TenantId::new();
        let count_id = CountId(AggregateId::new());
        let seeds = vec![seed(10, 500), seed(4, 250)];

        let ev = scheduled(tenant_id, count_id, seeds.clone());
        projection.apply_envelope(&envelope(tenant_id, count_id, 1, &ev)).unwrap();

        let ev = recorded(tenant_id, count_id, &seeds[0], 8);
        projection.apply_envelope(&envelope(tenant_id, count_id, 2, &ev)).unwrap();

        let overview = projection.overview(tenant_id, count_id).unwrap();
        assert_eq!(overview.total_items, 2);
        assert_eq!(overview.counted_items, 1);
        assert_eq!(overview.items_with_variance, 1);
        assert_eq!(overview.total_variance_value, -1000);
        assert!((overview.progress_percent - 50.0).abs() < f64::EPSILON);
        // Accuracy over all items, counted or not, matching `CountSummary`.
        assert!((overview.accuracy_percent - 50.0).abs() < f64::EPSILON);
        assert_eq!(overview.by_category.major, 1);
    }

    #[test]
    fn overview_rollup_matches_the_domain_summary() {
        let projection = projection();
        let tenant_id = TenantId::new();
        let count_id = CountId(AggregateId::new());
        let seeds = vec![seed(10, 500), seed(4, 250), seed(7, 100)];

        let ev = scheduled(tenant_id, count_id, seeds.clone());
        projection.apply_envelope(&envelope(tenant_id, count_id, 1, &ev)).unwrap();
        // One exact count, one shortage, one line left pending.
        let ev = recorded(tenant_id, count_id, &seeds[0], 10);
        projection.apply_envelope(&envelope(tenant_id, count_id, 2, &ev)).unwrap();
        let ev = recorded(tenant_id, count_id, &seeds[1], 3);
        projection.apply_envelope(&envelope(tenant_id, count_id, 3, &ev)).unwrap();

        let overview = projection.overview(tenant_id, count_id).unwrap();
        assert_eq!(overview.counted_items, 2);
        assert_eq!(overview.items_with_variance, 1);
        // (3 - 1) / 3 * 100
        assert!((overview.accuracy_percent - 200.0 / 3.0).abs() < 1e-9);
        // Exact counts never land in a severity bucket.
        let tally = overview.by_category;
        assert_eq!((tally.minor, tally.moderate, tally.major), (0, 0, 1));
    }

    #[test]
    fn duplicate_envelopes_are_skipped() {
        let projection = projection();
        let tenant_id = TenantId::new();
        let count_id = CountId(AggregateId::new());
        let seeds = vec![seed(10, 100)];

        let ev = scheduled(tenant_id, count_id, seeds.clone());
        projection.apply_envelope(&envelope(tenant_id, count_id, 1, &ev)).unwrap();

        let ev = recorded(tenant_id, count_id, &seeds[0], 9);
        let env = envelope(tenant_id, count_id, 2, &ev);
        projection.apply_envelope(&env).unwrap();
        projection.apply_envelope(&env).unwrap();

        let overview = projection.overview(tenant_id, count_id).unwrap();
        assert_eq!(overview.counted_items, 1);
        assert_eq!(overview.total_variance_value, -100);
    }

    #[test]
    fn rebuild_replays_from_scratch() {
        let projection = projection();
        let tenant_id = TenantId::new();
        let count_id = CountId(AggregateId::new());
        let seeds = vec![seed(5, 100)];

        let scheduled_ev = scheduled(tenant_id, count_id, seeds.clone());
        let recorded_ev = recorded(tenant_id, count_id, &seeds[0], 5);
        let envelopes = vec![
            envelope(tenant_id, count_id, 1, &scheduled_ev),
            envelope(tenant_id, count_id, 2, &recorded_ev),
        ];

        for env in &envelopes {
            projection.apply_envelope(env).unwrap();
        }
        projection.rebuild(tenant_id, envelopes).unwrap();

        let overview = projection.overview(tenant_id, count_id).unwrap();
        assert_eq!(overview.counted_items, 1);
        assert_eq!(overview.items_with_variance, 0);
        assert!((overview.accuracy_percent - 100.0).abs() < f64::EPSILON);
        assert!(projection.last_counted(tenant_id, seeds[0].product_id).is_some());
    }

    #[test]
    fn envelope_event_types_round_trip() {
        let tenant_id = TenantId::new();
        let count_id = CountId(AggregateId::new());
        let ev = scheduled(tenant_id, count_id, vec![]);
        assert_eq!(ev.event_type(), "count.scheduled");
    }
}
