//! Approval and adjustment processing.
//!
//! Approving reviewed variance lines is the one place the engine touches
//! the outside world (the inventory system). The ordering rule is strict:
//! the stock adjustment is applied BEFORE the approval event is appended,
//! so the stream can never claim an adjustment that was not made. The
//! reverse gap (adjustment applied, append failed) is closed by the
//! idempotent adjustment reference `{count_id}/{item_id}`: a retry finds
//! the adjustment already applied and deduplicates.
//!
//! Per-item failures never abort the batch; each item lands in exactly one
//! of approved / already_approved / failed.

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;

use stocktally_core::{TenantId, UserId};
use stocktally_counts::{
    ApproveLine, CountCommand, CountError, CountId, CountItemId, CountLine, CountStatus,
    StockCount,
};
use stocktally_events::{EventBus, EventEnvelope};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, StoredEvent};
use crate::stock_gateway::{StockGateway, StockGatewayError};

/// Stream aggregate type tag for stock counts.
pub const COUNT_AGGREGATE_TYPE: &str = "stock_count";

/// Bounded redispatch on optimistic concurrency conflicts.
const MAX_CONFLICT_RETRIES: u32 = 3;

/// What to approve and how.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Explicit line selection. Ignored when `approve_all` is set.
    pub item_ids: Vec<CountItemId>,
    /// Approve every counted, not-yet-approved line.
    pub approve_all: bool,
    pub notes: Option<String>,
    /// When false, variances are signed off without touching stock.
    pub create_adjustments: bool,
    pub approved_by: UserId,
}

/// Why one line could not be approved. The rest of the batch proceeds.
#[derive(Debug, Clone, Error)]
pub enum ApprovalItemError {
    #[error("item not found in this count")]
    NotFound,

    #[error("item has no counted quantity")]
    NotCounted,

    #[error("stock adjustment failed: {0}")]
    AdjustmentFailed(StockGatewayError),

    #[error("write conflict persisted after retries: {0}")]
    Conflict(String),

    #[error("{0}")]
    Domain(String),
}

#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub item_id: CountItemId,
    pub error: ApprovalItemError,
}

/// Batch result. `status` is the count's lifecycle status after the batch;
/// it flips to completed only when the final outstanding line is approved.
#[derive(Debug)]
pub struct ApprovalOutcome {
    pub approved: Vec<CountItemId>,
    pub already_approved: Vec<CountItemId>,
    pub failed: Vec<ItemFailure>,
    /// Sum of variance values across newly approved lines.
    pub total_variance_value: i64,
    pub status: CountStatus,
    /// Committed events, for synchronous projection updates.
    pub events: Vec<StoredEvent>,
}

/// Whole-batch failure: nothing was attempted.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("count not found")]
    CountNotFound,

    #[error("count is not in review (status: {0})")]
    NotInReview(CountStatus),

    #[error("dispatch failed: {0:?}")]
    Dispatch(DispatchError),
}

impl From<DispatchError> for ApprovalError {
    fn from(value: DispatchError) -> Self {
        ApprovalError::Dispatch(value)
    }
}

/// Run one approval batch against a count in review.
pub fn process_approval<S, B, G>(
    dispatcher: &CommandDispatcher<S, B>,
    gateway: &G,
    tenant_id: TenantId,
    count_id: CountId,
    request: &ApprovalRequest,
) -> Result<ApprovalOutcome, ApprovalError>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    G: StockGateway,
{
    let count = load_count(dispatcher, tenant_id, count_id)?;
    if !count.exists() {
        return Err(ApprovalError::CountNotFound);
    }
    if count.status() != CountStatus::Review {
        return Err(ApprovalError::NotInReview(count.status()));
    }

    let targets: Vec<CountItemId> = if request.approve_all {
        count
            .lines()
            .iter()
            .filter(|l| l.is_counted() && !l.is_approved())
            .map(|l| l.item_id)
            .collect()
    } else {
        request.item_ids.clone()
    };

    let mut outcome = ApprovalOutcome {
        approved: Vec::new(),
        already_approved: Vec::new(),
        failed: Vec::new(),
        total_variance_value: 0,
        status: count.status(),
        events: Vec::new(),
    };

    for item_id in targets {
        // Check against fresh state; earlier approvals in this batch may
        // have changed it.
        let count = load_count(dispatcher, tenant_id, count_id)?;
        let Some(line) = count.line(item_id) else {
            outcome.failed.push(ItemFailure {
                item_id,
                error: ApprovalItemError::NotFound,
            });
            continue;
        };
        if !line.is_counted() {
            outcome.failed.push(ItemFailure {
                item_id,
                error: ApprovalItemError::NotCounted,
            });
            continue;
        }
        if line.is_approved() {
            outcome.already_approved.push(item_id);
            continue;
        }

        let line = line.clone();
        match approve_one(dispatcher, gateway, tenant_id, count_id, &line, request) {
            Ok(ApprovedLine::Committed { events, adjusted }) => {
                outcome.approved.push(item_id);
                if let Some(v) = line.variance {
                    outcome.total_variance_value = outcome.total_variance_value.saturating_add(v.value);
                }
                outcome.events.extend(events);
                tracing::info!(
                    %tenant_id,
                    %count_id,
                    %item_id,
                    adjustment = adjusted,
                    "variance line approved"
                );
            }
            Ok(ApprovedLine::AlreadyApproved) => {
                outcome.already_approved.push(item_id);
            }
            Err(error) => {
                tracing::warn!(%tenant_id, %count_id, %item_id, %error, "line approval failed");
                outcome.failed.push(ItemFailure { item_id, error });
            }
        }
    }

    let count = load_count(dispatcher, tenant_id, count_id)?;
    outcome.status = count.status();
    Ok(outcome)
}

fn load_count<S, B>(
    dispatcher: &CommandDispatcher<S, B>,
    tenant_id: TenantId,
    count_id: CountId,
) -> Result<StockCount, ApprovalError>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    dispatcher
        .load(tenant_id, count_id.0, |_, id| StockCount::empty(CountId(id)))
        .map_err(ApprovalError::from)
}

enum ApprovedLine {
    Committed { events: Vec<StoredEvent>, adjusted: bool },
    /// A concurrent approver got there first; treated as success.
    AlreadyApproved,
}

fn approve_one<S, B, G>(
    dispatcher: &CommandDispatcher<S, B>,
    gateway: &G,
    tenant_id: TenantId,
    count_id: CountId,
    line: &CountLine,
    request: &ApprovalRequest,
) -> Result<ApprovedLine, ApprovalItemError>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    G: StockGateway,
{
    let delta = line
        .variance
        .map(|v| v.qty)
        .ok_or(ApprovalItemError::NotCounted)?;

    // Adjustment first. Skipped for zero variance: there is nothing to move.
    let mut adjustment_created = false;
    let mut adjustment_reference = None;
    if request.create_adjustments && delta != 0 {
        let reference = format!("{}/{}", count_id, line.item_id);
        gateway
            .apply_adjustment(tenant_id, line.product_id, delta, &reference)
            .map_err(ApprovalItemError::AdjustmentFailed)?;
        adjustment_created = true;
        adjustment_reference = Some(reference);
    }

    let command = CountCommand::ApproveLine(ApproveLine {
        tenant_id,
        count_id,
        item_id: line.item_id,
        approved_by: request.approved_by,
        notes: request.notes.clone(),
        adjustment_created,
        adjustment_reference,
        occurred_at: Utc::now(),
    });

    // The adjustment is idempotent on its reference, so redispatching after
    // a conflict cannot double-apply stock.
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let result = dispatcher.dispatch(
            tenant_id,
            count_id.0,
            COUNT_AGGREGATE_TYPE,
            command.clone(),
            |_, id| StockCount::empty(CountId(id)),
        );
        match result {
            Ok(events) => {
                return Ok(ApprovedLine::Committed {
                    events,
                    adjusted: adjustment_created,
                });
            }
            Err(DispatchError::Domain(CountError::AlreadyApproved(_))) => {
                return Ok(ApprovedLine::AlreadyApproved);
            }
            Err(DispatchError::Domain(err)) => {
                return Err(ApprovalItemError::Domain(err.to_string()));
            }
            Err(DispatchError::Concurrency(msg)) if attempts < MAX_CONFLICT_RETRIES => {
                tracing::debug!(%tenant_id, %count_id, attempts, "approval dispatch conflict, retrying: {msg}");
            }
            Err(DispatchError::Concurrency(msg)) => {
                return Err(ApprovalItemError::Conflict(msg));
            }
            Err(other) => {
                return Err(ApprovalItemError::Domain(format!("{other:?}")));
            }
        }
    }
}
