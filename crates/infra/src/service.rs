//! Count service: the application surface of the reconciliation engine.
//!
//! Wires the scope resolver, command dispatcher, approval processor and
//! overview projection into the operations callers actually invoke. All
//! writes go through the event-sourced pipeline; all listings come from the
//! projection; detail reads rehydrate the aggregate so they are never
//! stale.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stocktally_catalog::{CategoryId, ProductCatalog, ProductId};
use stocktally_core::{AggregateId, TenantId, UserId};
use stocktally_counts::{
    CountCommand, CountError, CountId, CountItemId, CountStatus, CountSummary, CountType,
    ItemCondition, ItemStatus, RecordLine, RequestTransition, ScheduleCount, StockCount,
    TransitionRecord, Variance, VarianceCategory, VariancePolicy,
};
use stocktally_events::{EventBus, EventEnvelope};

use crate::approval::{
    process_approval, ApprovalError, ApprovalOutcome, ApprovalRequest, COUNT_AGGREGATE_TYPE,
};
use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, StoredEvent};
use crate::projections::{CountFacts, CountOverview, CountOverviewProjection, CountProjectionError};
use crate::read_model::TenantStore;
use crate::stock_gateway::StockGateway;
use crate::strategy::{ScopeError, ScopeRequest, ScopeResolver};

const MAX_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("count not found")]
    NotFound,

    #[error(transparent)]
    Domain(#[from] CountError),

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error("write conflict persisted after retries: {0}")]
    Conflict(String),

    #[error("projection update failed: {0}")]
    Projection(#[from] CountProjectionError),

    #[error("infrastructure failure: {0}")]
    Infra(String),
}

impl From<DispatchError> for ServiceError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Domain(err) => ServiceError::Domain(err),
            DispatchError::Concurrency(msg) => ServiceError::Conflict(msg),
            other => ServiceError::Infra(format!("{other:?}")),
        }
    }
}

/// Parameters for scheduling a new count.
#[derive(Debug, Clone)]
pub struct CreateCountRequest {
    pub count_type: CountType,
    pub blind: bool,
    pub count_date: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub category_id: Option<CategoryId>,
    /// Explicit product scope (spot counts).
    pub product_ids: Vec<ProductId>,
    pub assigned_to: Option<UserId>,
    pub notes: Option<String>,
    pub scheduled_by: UserId,
}

/// Listing filter. All criteria are optional and conjunctive.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<CountStatus>,
    pub count_type: Option<CountType>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// 1-based page number. Zero is treated as the first page.
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug)]
pub struct CountPage {
    pub rows: Vec<CountOverview>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Who is looking at a count detail. Blind counts hide expectations from
/// the people doing the counting; reviewers see everything.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DetailView {
    Counter,
    Reviewer,
}

/// One line of a count as presented to a caller. Expectation fields are
/// `None` when redacted for a blind count in progress.
#[derive(Debug, Clone)]
pub struct LineView {
    pub item_id: CountItemId,
    pub product_id: ProductId,
    pub product_name: String,
    pub system_qty: Option<i64>,
    pub counted_qty: Option<i64>,
    pub variance: Option<Variance>,
    pub variance_category: Option<VarianceCategory>,
    pub status: ItemStatus,
    pub condition: ItemCondition,
    pub count_method: String,
    pub counter: Option<UserId>,
    pub counted_at: Option<DateTime<Utc>>,
    pub approved: bool,
}

#[derive(Debug)]
pub struct CountDetail {
    pub count_id: CountId,
    pub sequence_no: String,
    pub count_type: CountType,
    pub status: CountStatus,
    pub blind: bool,
    pub count_date: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub category_id: Option<CategoryId>,
    pub assigned_to: Option<UserId>,
    pub notes: Option<String>,
    pub progress_percent: f64,
    pub lines: Vec<LineView>,
    pub transitions: Vec<TransitionRecord>,
    /// Absent while redacted (blind count viewed by a counter).
    pub summary: Option<CountSummary>,
}

/// One item in a bulk recording request.
#[derive(Debug, Clone)]
pub struct RecordItemRequest {
    pub item_id: CountItemId,
    /// A missing quantity is rejected, not treated as zero.
    pub counted_qty: Option<i64>,
    pub condition: ItemCondition,
    pub count_method: Option<String>,
    pub notes: Option<String>,
    pub counter: UserId,
}

#[derive(Debug)]
pub struct BulkRejection {
    pub item_id: CountItemId,
    pub reason: String,
}

/// Partial-success result of a bulk recording.
#[derive(Debug)]
pub struct BulkRecordOutcome {
    pub accepted: Vec<CountItemId>,
    pub rejected: Vec<BulkRejection>,
}

#[derive(Debug, Clone)]
pub struct VarianceRow {
    pub item_id: CountItemId,
    pub product_id: ProductId,
    pub product_name: String,
    pub system_qty: i64,
    pub counted_qty: i64,
    pub variance: Variance,
    pub variance_category: VarianceCategory,
    pub approved: bool,
}

/// Non-zero variances of one count, largest value impact first.
#[derive(Debug)]
pub struct VarianceReport {
    pub count_id: CountId,
    pub sequence_no: String,
    pub rows: Vec<VarianceRow>,
    pub total_variance_value: i64,
}

/// Cross-count rollup for dashboards. Derived from the projection, never
/// authoritative.
#[derive(Debug, Default, PartialEq)]
pub struct CountAnalytics {
    pub total_counts: usize,
    pub draft: usize,
    pub in_progress: usize,
    pub review: usize,
    pub approved: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub total_variance_value: i64,
    /// Mean accuracy across completed counts in range; `None` when there
    /// are none.
    pub average_accuracy_percent: Option<f64>,
}

pub struct CountService<S, B, C, G, RS>
where
    RS: TenantStore<CountId, CountFacts>,
{
    dispatcher: CommandDispatcher<S, B>,
    resolver: ScopeResolver<C>,
    gateway: G,
    projection: CountOverviewProjection<RS>,
    policy: VariancePolicy,
}

impl<S, B, C, G, RS> CountService<S, B, C, G, RS>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    C: ProductCatalog,
    G: StockGateway,
    RS: TenantStore<CountId, CountFacts>,
{
    pub fn new(store: S, bus: B, catalog: C, gateway: G, read_store: RS) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store, bus),
            resolver: ScopeResolver::new(catalog),
            gateway,
            projection: CountOverviewProjection::new(read_store),
            policy: VariancePolicy::default(),
        }
    }

    pub fn with_variance_policy(mut self, policy: VariancePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Schedule a new count. The scope is resolved and frozen here; later
    /// catalog changes do not touch an existing count.
    pub fn create_count(
        &self,
        tenant_id: TenantId,
        request: CreateCountRequest,
    ) -> Result<CountOverview, ServiceError> {
        let scope = ScopeRequest {
            category_id: request.category_id,
            product_ids: request.product_ids.clone(),
        };
        let lines = self.resolver.resolve(
            tenant_id,
            request.count_type,
            &scope,
            |p| self.projection.last_counted(tenant_id, p),
            Utc::now(),
            &mut rand::thread_rng(),
        )?;

        let count_id = CountId(AggregateId::new());
        let sequence_no = format!("SC-{:04}", self.projection.count_rows(tenant_id) + 1);

        let command = CountCommand::Schedule(ScheduleCount {
            tenant_id,
            count_id,
            sequence_no,
            count_type: request.count_type,
            blind: request.blind,
            count_date: request.count_date,
            deadline: request.deadline,
            category_id: request.category_id,
            assigned_to: request.assigned_to,
            notes: request.notes,
            lines,
            scheduled_by: request.scheduled_by,
            occurred_at: Utc::now(),
        });

        let events = self.dispatch(tenant_id, count_id, command)?;
        self.project(&events)?;

        tracing::info!(%tenant_id, %count_id, "count scheduled");
        self.projection
            .overview(tenant_id, count_id)
            .ok_or(ServiceError::NotFound)
    }

    pub fn list_counts(&self, tenant_id: TenantId, filter: &ListFilter) -> CountPage {
        let rows: Vec<CountOverview> = self
            .projection
            .list(tenant_id)
            .into_iter()
            .filter(|row| {
                filter.status.is_none_or(|s| row.status == s)
                    && filter.count_type.is_none_or(|t| row.count_type == t)
                    && filter.date_from.is_none_or(|from| row.count_date >= from)
                    && filter.date_to.is_none_or(|to| row.count_date <= to)
            })
            .collect();

        let total = rows.len();
        let page = filter.page.max(1);
        let page_size = if filter.page_size == 0 { total.max(1) } else { filter.page_size };
        let rows = rows
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        CountPage {
            rows,
            total,
            page,
            page_size,
        }
    }

    /// Read one count in full, rehydrated from its stream.
    ///
    /// For a blind count that is still being counted, the counter view
    /// redacts system quantities, variances and the summary. Reviewers,
    /// and anyone once the count reaches review, see everything.
    pub fn get_count_detail(
        &self,
        tenant_id: TenantId,
        count_id: CountId,
        view: DetailView,
    ) -> Result<CountDetail, ServiceError> {
        let count = self.load(tenant_id, count_id)?;

        let redact = count.blind()
            && view == DetailView::Counter
            && matches!(count.status(), CountStatus::Draft | CountStatus::InProgress);

        let lines = count
            .lines()
            .iter()
            .map(|line| LineView {
                item_id: line.item_id,
                product_id: line.product_id,
                product_name: line.product_name.clone(),
                system_qty: if redact { None } else { Some(line.system_qty) },
                counted_qty: line.counted_qty,
                variance: if redact { None } else { line.variance },
                variance_category: if redact { None } else { line.variance_category },
                status: line.status(),
                condition: line.condition,
                count_method: line.count_method.clone(),
                counter: line.counter,
                counted_at: line.counted_at,
                approved: line.is_approved(),
            })
            .collect();

        Ok(CountDetail {
            count_id,
            sequence_no: count.sequence_no().to_string(),
            count_type: count.count_type(),
            status: count.status(),
            blind: count.blind(),
            count_date: count.count_date(),
            deadline: count.deadline(),
            category_id: count.category_id(),
            assigned_to: count.assigned_to(),
            notes: count.notes().map(str::to_string),
            progress_percent: count.progress_percent(),
            lines,
            transitions: count.transitions().to_vec(),
            summary: if redact { None } else { Some(count.summary()) },
        })
    }

    /// Record one counted quantity. Recounting an already counted line is
    /// allowed while the count is editable; the variance is recomputed in
    /// the same write.
    pub fn record_item(
        &self,
        tenant_id: TenantId,
        count_id: CountId,
        request: RecordItemRequest,
    ) -> Result<LineView, ServiceError> {
        let counted_qty = request.counted_qty.ok_or_else(|| {
            ServiceError::Domain(CountError::InvalidQuantity(
                "counted quantity is required".to_string(),
            ))
        })?;

        let command = CountCommand::RecordLine(RecordLine {
            tenant_id,
            count_id,
            item_id: request.item_id,
            counted_qty,
            condition: request.condition,
            count_method: request.count_method,
            notes: request.notes,
            counter: request.counter,
            occurred_at: Utc::now(),
        });

        let events = self.dispatch_with_retry(tenant_id, count_id, command)?;
        self.project(&events)?;

        let count = self.load(tenant_id, count_id)?;
        let line = count
            .line(request.item_id)
            .ok_or(ServiceError::Domain(CountError::ItemNotFound(request.item_id)))?;
        Ok(LineView {
            item_id: line.item_id,
            product_id: line.product_id,
            product_name: line.product_name.clone(),
            system_qty: Some(line.system_qty),
            counted_qty: line.counted_qty,
            variance: line.variance,
            variance_category: line.variance_category,
            status: line.status(),
            condition: line.condition,
            count_method: line.count_method.clone(),
            counter: line.counter,
            counted_at: line.counted_at,
            approved: line.is_approved(),
        })
    }

    /// Record a batch of quantities. Each row is validated and written
    /// independently; a bad row never blocks the rest of the batch.
    pub fn bulk_record(
        &self,
        tenant_id: TenantId,
        count_id: CountId,
        rows: Vec<RecordItemRequest>,
    ) -> Result<BulkRecordOutcome, ServiceError> {
        // Whole-batch preconditions fail fast.
        let count = self.load(tenant_id, count_id)?;
        if !count.is_editable() {
            return Err(ServiceError::Domain(CountError::InvalidCountState {
                status: count.status(),
            }));
        }

        let mut outcome = BulkRecordOutcome {
            accepted: Vec::new(),
            rejected: Vec::new(),
        };

        for row in rows {
            let item_id = row.item_id;
            match self.record_item(tenant_id, count_id, row) {
                Ok(_) => outcome.accepted.push(item_id),
                Err(err) => outcome.rejected.push(BulkRejection {
                    item_id,
                    reason: err.to_string(),
                }),
            }
        }

        tracing::info!(
            %tenant_id,
            %count_id,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            "bulk recording finished"
        );
        Ok(outcome)
    }

    /// Take one lifecycle step (start, submit, reopen, cancel).
    pub fn transition(
        &self,
        tenant_id: TenantId,
        count_id: CountId,
        target: CountStatus,
        actor: UserId,
        notes: Option<String>,
    ) -> Result<CountStatus, ServiceError> {
        let command = CountCommand::Transition(RequestTransition {
            tenant_id,
            count_id,
            target,
            actor,
            notes,
            occurred_at: Utc::now(),
        });

        let events = self.dispatch_with_retry(tenant_id, count_id, command)?;
        self.project(&events)?;

        let count = self.load(tenant_id, count_id)?;
        tracing::info!(%tenant_id, %count_id, status = %count.status(), "count transitioned");
        Ok(count.status())
    }

    /// Approve reviewed variance lines and apply their stock adjustments.
    pub fn approve(
        &self,
        tenant_id: TenantId,
        count_id: CountId,
        request: &ApprovalRequest,
    ) -> Result<ApprovalOutcome, ServiceError> {
        let outcome = process_approval(&self.dispatcher, &self.gateway, tenant_id, count_id, request)?;
        self.project(&outcome.events)?;
        Ok(outcome)
    }

    /// Non-zero variances of one count, sorted by absolute value impact.
    pub fn variance_report(
        &self,
        tenant_id: TenantId,
        count_id: CountId,
    ) -> Result<VarianceReport, ServiceError> {
        let count = self.load(tenant_id, count_id)?;

        let mut rows: Vec<VarianceRow> = count
            .lines()
            .iter()
            .filter_map(|line| {
                let variance = line.variance?;
                if variance.is_zero() {
                    return None;
                }
                Some(VarianceRow {
                    item_id: line.item_id,
                    product_id: line.product_id,
                    product_name: line.product_name.clone(),
                    system_qty: line.system_qty,
                    counted_qty: line.counted_qty?,
                    variance,
                    variance_category: line.variance_category?,
                    approved: line.is_approved(),
                })
            })
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.variance.value.abs()));

        let total_variance_value = rows.iter().map(|r| r.variance.value).sum();
        Ok(VarianceReport {
            count_id,
            sequence_no: count.sequence_no().to_string(),
            rows,
            total_variance_value,
        })
    }

    /// Rollup across counts whose count date falls in the given range.
    pub fn analytics(
        &self,
        tenant_id: TenantId,
        date_from: Option<DateTime<Utc>>,
        date_to: Option<DateTime<Utc>>,
    ) -> CountAnalytics {
        let mut analytics = CountAnalytics::default();
        let mut accuracy_sum = 0.0;
        let mut accuracy_n = 0usize;

        for row in self.projection.list(tenant_id) {
            if date_from.is_some_and(|from| row.count_date < from)
                || date_to.is_some_and(|to| row.count_date > to)
            {
                continue;
            }
            analytics.total_counts += 1;
            match row.status {
                CountStatus::Draft => analytics.draft += 1,
                CountStatus::InProgress => analytics.in_progress += 1,
                CountStatus::Review => analytics.review += 1,
                CountStatus::Approved => analytics.approved += 1,
                CountStatus::Completed => analytics.completed += 1,
                CountStatus::Cancelled => analytics.cancelled += 1,
            }
            analytics.total_variance_value =
                analytics.total_variance_value.saturating_add(row.total_variance_value);
            if row.status == CountStatus::Completed {
                accuracy_sum += row.accuracy_percent;
                accuracy_n += 1;
            }
        }

        if accuracy_n > 0 {
            analytics.average_accuracy_percent = Some(accuracy_sum / accuracy_n as f64);
        }
        analytics
    }

    /// Throw away this tenant's derived views and replay them from the
    /// stream.
    pub fn rebuild_read_models(&self, tenant_id: TenantId) -> Result<(), ServiceError> {
        let (store, _) = self.dispatcher_parts();
        let events = store
            .load_tenant(tenant_id)
            .map_err(|e| ServiceError::Infra(e.to_string()))?;
        let envelopes = events.iter().map(StoredEvent::to_envelope);
        self.projection.rebuild(tenant_id, envelopes)?;
        tracing::info!(%tenant_id, "read models rebuilt");
        Ok(())
    }

    pub fn overview(&self, tenant_id: TenantId, count_id: CountId) -> Option<CountOverview> {
        self.projection.overview(tenant_id, count_id)
    }

    fn dispatcher_parts(&self) -> (&S, &B) {
        self.dispatcher.parts()
    }

    fn load(&self, tenant_id: TenantId, count_id: CountId) -> Result<StockCount, ServiceError> {
        let policy = self.policy;
        let count = self
            .dispatcher
            .load(tenant_id, count_id.0, move |_, id| {
                StockCount::empty(CountId(id)).with_policy(policy)
            })?;
        if !count.exists() {
            return Err(ServiceError::NotFound);
        }
        Ok(count)
    }

    fn dispatch(
        &self,
        tenant_id: TenantId,
        count_id: CountId,
        command: CountCommand,
    ) -> Result<Vec<StoredEvent>, ServiceError> {
        let policy = self.policy;
        self.dispatcher
            .dispatch(
                tenant_id,
                count_id.0,
                COUNT_AGGREGATE_TYPE,
                command,
                move |_, id| StockCount::empty(CountId(id)).with_policy(policy),
            )
            .map_err(ServiceError::from)
    }

    /// Redispatch on optimistic concurrency conflicts. The command is
    /// re-decided against the fresh stream each attempt.
    fn dispatch_with_retry(
        &self,
        tenant_id: TenantId,
        count_id: CountId,
        command: CountCommand,
    ) -> Result<Vec<StoredEvent>, ServiceError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.dispatch(tenant_id, count_id, command.clone()) {
                Err(ServiceError::Conflict(msg)) if attempts < MAX_CONFLICT_RETRIES => {
                    tracing::debug!(%tenant_id, %count_id, attempts, "write conflict, retrying: {msg}");
                }
                other => return other,
            }
        }
    }

    fn project(&self, events: &[StoredEvent]) -> Result<(), ServiceError> {
        for event in events {
            self.projection.apply_envelope(&event.to_envelope())?;
        }
        Ok(())
    }
}
