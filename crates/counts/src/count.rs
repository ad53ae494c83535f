use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stocktally_catalog::{CategoryId, ProductId};
use stocktally_core::{Aggregate, AggregateId, AggregateRoot, Entity, TenantId, UserId};
use stocktally_events::{Command, Event};

use crate::error::CountError;
use crate::summary::CountSummary;
use crate::variance::{compute_variance, Variance, VarianceCategory, VariancePolicy};

/// Recording method recorded on a line when the caller does not name one.
pub const DEFAULT_COUNT_METHOD: &str = "manual";

/// Stock count identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountId(pub AggregateId);

impl CountId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for CountId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of one line (one product) within a count.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountItemId(Uuid);

impl CountItemId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CountItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for CountItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Strategy that determined this count's item set.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountType {
    Full,
    Cycle,
    Spot,
    Category,
}

/// Count lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountStatus {
    Draft,
    InProgress,
    Review,
    Approved,
    Completed,
    Cancelled,
}

impl CountStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CountStatus::Approved | CountStatus::Completed | CountStatus::Cancelled
        )
    }
}

impl core::fmt::Display for CountStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            CountStatus::Draft => "draft",
            CountStatus::InProgress => "in_progress",
            CountStatus::Review => "review",
            CountStatus::Approved => "approved",
            CountStatus::Completed => "completed",
            CountStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-line recording status. Derived: `counted` iff a quantity is present.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Counted,
}

/// Physical condition observed while counting.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCondition {
    #[default]
    Good,
    Damaged,
    Expired,
    NotFound,
}

/// Immutable product snapshot a count line is seeded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSeed {
    pub item_id: CountItemId,
    pub product_id: ProductId,
    pub product_name: String,
    /// System quantity frozen at count creation.
    pub system_qty: i64,
    /// Unit cost in smallest currency unit, frozen at count creation.
    pub unit_cost: u64,
}

/// Approval bookkeeping for one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineApprovalState {
    pub approved_by: UserId,
    pub approved_at: DateTime<Utc>,
    pub notes: Option<String>,
    /// Whether a stock adjustment was emitted for this approval.
    pub adjustment_created: bool,
    /// Deterministic reference of the emitted adjustment, if any.
    pub adjustment_reference: Option<String>,
}

/// One product's expected-vs-counted record within a count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountLine {
    pub item_id: CountItemId,
    pub product_id: ProductId,
    pub product_name: String,
    pub system_qty: i64,
    pub unit_cost: u64,
    pub counted_qty: Option<i64>,
    pub variance: Option<Variance>,
    pub variance_category: Option<VarianceCategory>,
    pub condition: ItemCondition,
    pub count_method: String,
    pub notes: Option<String>,
    pub counter: Option<UserId>,
    pub counted_at: Option<DateTime<Utc>>,
    pub approval: Option<LineApprovalState>,
}

impl CountLine {
    fn from_seed(seed: &LineSeed) -> Self {
        Self {
            item_id: seed.item_id,
            product_id: seed.product_id,
            product_name: seed.product_name.clone(),
            system_qty: seed.system_qty,
            unit_cost: seed.unit_cost,
            counted_qty: None,
            variance: None,
            variance_category: None,
            condition: ItemCondition::Good,
            count_method: DEFAULT_COUNT_METHOD.to_string(),
            notes: None,
            counter: None,
            counted_at: None,
            approval: None,
        }
    }

    /// `counted` iff a quantity has been recorded; never stored separately.
    pub fn status(&self) -> ItemStatus {
        if self.counted_qty.is_some() {
            ItemStatus::Counted
        } else {
            ItemStatus::Pending
        }
    }

    pub fn is_counted(&self) -> bool {
        self.counted_qty.is_some()
    }

    pub fn is_approved(&self) -> bool {
        self.approval.is_some()
    }
}

impl Entity for CountLine {
    type Id = CountItemId;

    fn id(&self) -> &Self::Id {
        &self.item_id
    }
}

/// One audited lifecycle transition, derived from the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: CountStatus,
    pub to: CountStatus,
    pub actor: UserId,
    pub at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Aggregate root: StockCount.
///
/// The count and its item ledger form a single consistency boundary: every
/// mutation is an event on one stream, so the derived figures (progress,
/// variance totals) can never disagree with the lines they come from.
#[derive(Debug, Clone, PartialEq)]
pub struct StockCount {
    id: CountId,
    tenant_id: Option<TenantId>,
    sequence_no: String,
    count_type: CountType,
    status: CountStatus,
    blind: bool,
    count_date: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    category_id: Option<CategoryId>,
    assigned_to: Option<UserId>,
    notes: Option<String>,
    lines: Vec<CountLine>,
    transitions: Vec<TransitionRecord>,
    policy: VariancePolicy,
    version: u64,
    created: bool,
}

impl StockCount {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: CountId) -> Self {
        Self {
            id,
            tenant_id: None,
            sequence_no: String::new(),
            count_type: CountType::Full,
            status: CountStatus::Draft,
            blind: false,
            count_date: DateTime::<Utc>::MIN_UTC,
            deadline: None,
            category_id: None,
            assigned_to: None,
            notes: None,
            lines: Vec::new(),
            transitions: Vec::new(),
            policy: VariancePolicy::default(),
            version: 0,
            created: false,
        }
    }

    /// Classification policy used when deciding `RecordLine` commands.
    ///
    /// The decided category is stored on the event, so replays never depend
    /// on whatever the policy is configured to at replay time.
    pub fn with_policy(mut self, policy: VariancePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id_typed(&self) -> CountId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn sequence_no(&self) -> &str {
        &self.sequence_no
    }

    pub fn count_type(&self) -> CountType {
        self.count_type
    }

    pub fn status(&self) -> CountStatus {
        self.status
    }

    pub fn blind(&self) -> bool {
        self.blind
    }

    pub fn count_date(&self) -> DateTime<Utc> {
        self.count_date
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn category_id(&self) -> Option<CategoryId> {
        self.category_id
    }

    pub fn assigned_to(&self) -> Option<UserId> {
        self.assigned_to
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn lines(&self) -> &[CountLine] {
        &self.lines
    }

    pub fn line(&self, item_id: CountItemId) -> Option<&CountLine> {
        self.lines.iter().find(|l| l.item_id == item_id)
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn exists(&self) -> bool {
        self.created
    }

    pub fn total_items(&self) -> usize {
        self.lines.len()
    }

    /// Recomputed from the ledger on every call, never cached.
    pub fn counted_items(&self) -> usize {
        self.lines.iter().filter(|l| l.is_counted()).count()
    }

    pub fn all_counted(&self) -> bool {
        self.lines.iter().all(|l| l.is_counted())
    }

    pub fn all_approved(&self) -> bool {
        self.lines.iter().all(|l| l.is_approved())
    }

    /// `counted / total` as a percentage; 0 for an empty count.
    pub fn progress_percent(&self) -> f64 {
        if self.lines.is_empty() {
            0.0
        } else {
            self.counted_items() as f64 / self.lines.len() as f64 * 100.0
        }
    }

    pub fn is_editable(&self) -> bool {
        matches!(self.status, CountStatus::Draft | CountStatus::InProgress)
    }

    /// Pure rollup of the ledger. Derived, never authoritative.
    pub fn summary(&self) -> CountSummary {
        CountSummary::from_lines(&self.lines)
    }
}

impl AggregateRoot for StockCount {
    type Id = CountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: ScheduleCount - create the count with its frozen item set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleCount {
    pub tenant_id: TenantId,
    pub count_id: CountId,
    pub sequence_no: String,
    pub count_type: CountType,
    pub blind: bool,
    pub count_date: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub category_id: Option<CategoryId>,
    pub assigned_to: Option<UserId>,
    pub notes: Option<String>,
    pub lines: Vec<LineSeed>,
    pub scheduled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RequestTransition - one lifecycle step toward `target`.
///
/// `Approved` and `Completed` are never reachable this way; they are owned
/// by the approval processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTransition {
    pub tenant_id: TenantId,
    pub count_id: CountId,
    pub target: CountStatus,
    pub actor: UserId,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordLine - record (or overwrite) one counted quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLine {
    pub tenant_id: TenantId,
    pub count_id: CountId,
    pub item_id: CountItemId,
    pub counted_qty: i64,
    pub condition: ItemCondition,
    pub count_method: Option<String>,
    pub notes: Option<String>,
    pub counter: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApproveLine - commit one reviewed variance.
///
/// Issued by the approval processor only, after the stock adjustment (if
/// requested) has been applied under `adjustment_reference`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveLine {
    pub tenant_id: TenantId,
    pub count_id: CountId,
    pub item_id: CountItemId,
    pub approved_by: UserId,
    pub notes: Option<String>,
    pub adjustment_created: bool,
    pub adjustment_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountCommand {
    Schedule(ScheduleCount),
    Transition(RequestTransition),
    RecordLine(RecordLine),
    ApproveLine(ApproveLine),
}

impl Command for CountCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        match self {
            CountCommand::Schedule(c) => c.count_id.0,
            CountCommand::Transition(c) => c.count_id.0,
            CountCommand::RecordLine(c) => c.count_id.0,
            CountCommand::ApproveLine(c) => c.count_id.0,
        }
    }
}

/// Event: CountScheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountScheduled {
    pub tenant_id: TenantId,
    pub count_id: CountId,
    pub sequence_no: String,
    pub count_type: CountType,
    pub blind: bool,
    pub count_date: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub category_id: Option<CategoryId>,
    pub assigned_to: Option<UserId>,
    pub notes: Option<String>,
    pub lines: Vec<LineSeed>,
    pub scheduled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: one lifecycle edge was taken (audit log entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub tenant_id: TenantId,
    pub count_id: CountId,
    pub from: CountStatus,
    pub to: CountStatus,
    pub actor: UserId,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineRecorded - a counted quantity (and its variance) landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRecorded {
    pub tenant_id: TenantId,
    pub count_id: CountId,
    pub item_id: CountItemId,
    /// Denormalized so downstream consumers need not join the schedule event.
    pub product_id: ProductId,
    pub counted_qty: i64,
    /// Quantity this recording overwrote, if the line was already counted.
    pub previous_qty: Option<i64>,
    pub variance: Variance,
    pub variance_category: VarianceCategory,
    pub condition: ItemCondition,
    pub count_method: String,
    pub notes: Option<String>,
    pub counter: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineApproved {
    pub tenant_id: TenantId,
    pub count_id: CountId,
    pub item_id: CountItemId,
    pub approved_by: UserId,
    pub notes: Option<String>,
    pub adjustment_created: bool,
    pub adjustment_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountEvent {
    CountScheduled(CountScheduled),
    CountStarted(StatusChanged),
    CountSubmitted(StatusChanged),
    CountReopened(StatusChanged),
    CountCancelled(StatusChanged),
    LineRecorded(LineRecorded),
    LineApproved(LineApproved),
    CountApproved(StatusChanged),
    CountCompleted(StatusChanged),
}

impl Event for CountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CountEvent::CountScheduled(_) => "count.scheduled",
            CountEvent::CountStarted(_) => "count.started",
            CountEvent::CountSubmitted(_) => "count.submitted",
            CountEvent::CountReopened(_) => "count.reopened",
            CountEvent::CountCancelled(_) => "count.cancelled",
            CountEvent::LineRecorded(_) => "count.line_recorded",
            CountEvent::LineApproved(_) => "count.line_approved",
            CountEvent::CountApproved(_) => "count.approved",
            CountEvent::CountCompleted(_) => "count.completed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CountEvent::CountScheduled(e) => e.occurred_at,
            CountEvent::CountStarted(e)
            | CountEvent::CountSubmitted(e)
            | CountEvent::CountReopened(e)
            | CountEvent::CountCancelled(e)
            | CountEvent::CountApproved(e)
            | CountEvent::CountCompleted(e) => e.occurred_at,
            CountEvent::LineRecorded(e) => e.occurred_at,
            CountEvent::LineApproved(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StockCount {
    type Command = CountCommand;
    type Event = CountEvent;
    type Error = CountError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CountEvent::CountScheduled(e) => {
                self.id = e.count_id;
                self.tenant_id = Some(e.tenant_id);
                self.sequence_no = e.sequence_no.clone();
                self.count_type = e.count_type;
                self.status = CountStatus::Draft;
                self.blind = e.blind;
                self.count_date = e.count_date;
                self.deadline = e.deadline;
                self.category_id = e.category_id;
                self.assigned_to = e.assigned_to;
                self.notes = e.notes.clone();
                self.lines = e.lines.iter().map(CountLine::from_seed).collect();
                self.transitions.clear();
                self.created = true;
            }
            CountEvent::CountStarted(e)
            | CountEvent::CountSubmitted(e)
            | CountEvent::CountReopened(e)
            | CountEvent::CountCancelled(e)
            | CountEvent::CountApproved(e)
            | CountEvent::CountCompleted(e) => {
                self.status = e.to;
                self.transitions.push(TransitionRecord {
                    from: e.from,
                    to: e.to,
                    actor: e.actor,
                    at: e.occurred_at,
                    notes: e.notes.clone(),
                });
            }
            CountEvent::LineRecorded(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.item_id == e.item_id) {
                    // All variance fields move together with the quantity.
                    line.counted_qty = Some(e.counted_qty);
                    line.variance = Some(e.variance);
                    line.variance_category = Some(e.variance_category);
                    line.condition = e.condition;
                    line.count_method = e.count_method.clone();
                    line.notes = e.notes.clone();
                    line.counter = Some(e.counter);
                    line.counted_at = Some(e.occurred_at);
                }
            }
            CountEvent::LineApproved(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.item_id == e.item_id) {
                    line.approval = Some(LineApprovalState {
                        approved_by: e.approved_by,
                        approved_at: e.occurred_at,
                        notes: e.notes.clone(),
                        adjustment_created: e.adjustment_created,
                        adjustment_reference: e.adjustment_reference.clone(),
                    });
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CountCommand::Schedule(cmd) => self.handle_schedule(cmd),
            CountCommand::Transition(cmd) => self.handle_transition(cmd),
            CountCommand::RecordLine(cmd) => self.handle_record(cmd),
            CountCommand::ApproveLine(cmd) => self.handle_approve(cmd),
        }
    }
}

impl StockCount {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), CountError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(CountError::validation("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_count_id(&self, count_id: CountId) -> Result<(), CountError> {
        if self.id != count_id {
            return Err(CountError::validation("count_id mismatch"));
        }
        Ok(())
    }

    fn status_changed(
        &self,
        to: CountStatus,
        cmd: &RequestTransition,
    ) -> StatusChanged {
        StatusChanged {
            tenant_id: cmd.tenant_id,
            count_id: cmd.count_id,
            from: self.status,
            to,
            actor: cmd.actor,
            notes: cmd.notes.clone(),
            occurred_at: cmd.occurred_at,
        }
    }

    fn handle_schedule(&self, cmd: &ScheduleCount) -> Result<Vec<CountEvent>, CountError> {
        if self.created {
            return Err(CountError::AlreadyExists);
        }
        if cmd.count_type == CountType::Category && cmd.category_id.is_none() {
            return Err(CountError::MissingCategory);
        }
        if cmd.sequence_no.trim().is_empty() {
            return Err(CountError::validation("sequence_no cannot be empty"));
        }

        // One line per product: the ledger key is (count, product).
        let mut product_ids: Vec<ProductId> = cmd.lines.iter().map(|l| l.product_id).collect();
        product_ids.sort_by_key(|p| *p.0.as_uuid());
        product_ids.dedup();
        if product_ids.len() != cmd.lines.len() {
            return Err(CountError::validation("duplicate product in count lines"));
        }

        Ok(vec![CountEvent::CountScheduled(CountScheduled {
            tenant_id: cmd.tenant_id,
            count_id: cmd.count_id,
            sequence_no: cmd.sequence_no.clone(),
            count_type: cmd.count_type,
            blind: cmd.blind,
            count_date: cmd.count_date,
            deadline: cmd.deadline,
            category_id: cmd.category_id,
            assigned_to: cmd.assigned_to,
            notes: cmd.notes.clone(),
            lines: cmd.lines.clone(),
            scheduled_by: cmd.scheduled_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_transition(&self, cmd: &RequestTransition) -> Result<Vec<CountEvent>, CountError> {
        if !self.created {
            return Err(CountError::NotFound);
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_count_id(cmd.count_id)?;

        let invalid = || CountError::InvalidTransition {
            from: self.status,
            to: cmd.target,
        };

        match (self.status, cmd.target) {
            (CountStatus::Draft, CountStatus::InProgress) => Ok(vec![CountEvent::CountStarted(
                self.status_changed(CountStatus::InProgress, cmd),
            )]),
            (CountStatus::InProgress, CountStatus::Review) => {
                // An empty ledger would pass `all_counted` vacuously but can
                // never be approved; progress stays 0 until lines exist.
                if self.lines.is_empty() || !self.all_counted() {
                    return Err(CountError::IncompleteCount {
                        counted: self.counted_items(),
                        total: self.total_items(),
                    });
                }
                Ok(vec![CountEvent::CountSubmitted(
                    self.status_changed(CountStatus::Review, cmd),
                )])
            }
            // Reject: back to counting, previously recorded quantities kept.
            (CountStatus::Review, CountStatus::InProgress) => Ok(vec![CountEvent::CountReopened(
                self.status_changed(CountStatus::InProgress, cmd),
            )]),
            (CountStatus::Draft | CountStatus::InProgress, CountStatus::Cancelled) => {
                Ok(vec![CountEvent::CountCancelled(
                    self.status_changed(CountStatus::Cancelled, cmd),
                )])
            }
            // Approval statuses are owned by the approval processor.
            (_, CountStatus::Approved | CountStatus::Completed) => Err(invalid()),
            _ => Err(invalid()),
        }
    }

    fn handle_record(&self, cmd: &RecordLine) -> Result<Vec<CountEvent>, CountError> {
        if !self.created {
            return Err(CountError::NotFound);
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_count_id(cmd.count_id)?;

        if !self.is_editable() {
            return Err(CountError::InvalidCountState {
                status: self.status,
            });
        }

        let line = self
            .line(cmd.item_id)
            .ok_or(CountError::ItemNotFound(cmd.item_id))?;

        if cmd.counted_qty < 0 {
            return Err(CountError::invalid_quantity(format!(
                "counted quantity cannot be negative (got {})",
                cmd.counted_qty
            )));
        }

        let variance = compute_variance(line.system_qty, cmd.counted_qty, line.unit_cost);
        let variance_category = self.policy.classify(variance.percent_bp);

        let count_method = cmd
            .count_method
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_COUNT_METHOD.to_string());

        Ok(vec![CountEvent::LineRecorded(LineRecorded {
            tenant_id: cmd.tenant_id,
            count_id: cmd.count_id,
            item_id: cmd.item_id,
            product_id: line.product_id,
            counted_qty: cmd.counted_qty,
            previous_qty: line.counted_qty,
            variance,
            variance_category,
            condition: cmd.condition,
            count_method,
            notes: cmd.notes.clone(),
            counter: cmd.counter,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_approve(&self, cmd: &ApproveLine) -> Result<Vec<CountEvent>, CountError> {
        if !self.created {
            return Err(CountError::NotFound);
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_count_id(cmd.count_id)?;

        if self.status != CountStatus::Review {
            return Err(CountError::InvalidCountState {
                status: self.status,
            });
        }

        let line = self
            .line(cmd.item_id)
            .ok_or(CountError::ItemNotFound(cmd.item_id))?;

        if !line.is_counted() {
            return Err(CountError::ItemNotCounted(cmd.item_id));
        }
        if line.is_approved() {
            // At most one approval per line; retries surface this softly.
            return Err(CountError::AlreadyApproved(cmd.item_id));
        }

        let mut events = vec![CountEvent::LineApproved(LineApproved {
            tenant_id: cmd.tenant_id,
            count_id: cmd.count_id,
            item_id: cmd.item_id,
            approved_by: cmd.approved_by,
            notes: cmd.notes.clone(),
            adjustment_created: cmd.adjustment_created,
            adjustment_reference: cmd.adjustment_reference.clone(),
            occurred_at: cmd.occurred_at,
        })];

        // Last outstanding approval closes the count.
        let outstanding = self.lines.iter().filter(|l| !l.is_approved()).count();
        if outstanding == 1 {
            let change = |from, to| StatusChanged {
                tenant_id: cmd.tenant_id,
                count_id: cmd.count_id,
                from,
                to,
                actor: cmd.approved_by,
                notes: cmd.notes.clone(),
                occurred_at: cmd.occurred_at,
            };
            events.push(CountEvent::CountApproved(change(
                CountStatus::Review,
                CountStatus::Approved,
            )));
            events.push(CountEvent::CountCompleted(change(
                CountStatus::Approved,
                CountStatus::Completed,
            )));
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stocktally_events::execute;

    fn tenant() -> TenantId {
        TenantId::new()
    }

    fn count_id() -> CountId {
        CountId::new(AggregateId::new())
    }

    fn actor() -> UserId {
        UserId::new()
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn seed(system_qty: i64, unit_cost: u64) -> LineSeed {
        LineSeed {
            item_id: CountItemId::new(),
            product_id: ProductId::new(AggregateId::new()),
            product_name: "Widget".to_string(),
            system_qty,
            unit_cost,
        }
    }

    fn schedule_cmd(
        tenant_id: TenantId,
        id: CountId,
        lines: Vec<LineSeed>,
    ) -> CountCommand {
        CountCommand::Schedule(ScheduleCount {
            tenant_id,
            count_id: id,
            sequence_no: "SC-0001".to_string(),
            count_type: CountType::Full,
            blind: false,
            count_date: now(),
            deadline: None,
            category_id: None,
            assigned_to: None,
            notes: None,
            lines,
            scheduled_by: actor(),
            occurred_at: now(),
        })
    }

    fn transition_cmd(tenant_id: TenantId, id: CountId, target: CountStatus) -> CountCommand {
        CountCommand::Transition(RequestTransition {
            tenant_id,
            count_id: id,
            target,
            actor: actor(),
            notes: None,
            occurred_at: now(),
        })
    }

    fn record_cmd(
        tenant_id: TenantId,
        id: CountId,
        item_id: CountItemId,
        qty: i64,
    ) -> CountCommand {
        CountCommand::RecordLine(RecordLine {
            tenant_id,
            count_id: id,
            item_id,
            counted_qty: qty,
            condition: ItemCondition::Good,
            count_method: None,
            notes: None,
            counter: actor(),
            occurred_at: now(),
        })
    }

    fn approve_cmd(tenant_id: TenantId, id: CountId, item_id: CountItemId) -> CountCommand {
        CountCommand::ApproveLine(ApproveLine {
            tenant_id,
            count_id: id,
            item_id,
            approved_by: actor(),
            notes: None,
            adjustment_created: true,
            adjustment_reference: Some(format!("{id}/{item_id}")),
            occurred_at: now(),
        })
    }

    /// Scheduled count with two lines, started and fully counted into review.
    fn count_in_review(qtys: [(i64, i64); 2]) -> (StockCount, TenantId, CountId, Vec<CountItemId>) {
        let tenant_id = tenant();
        let id = count_id();
        let seeds = vec![seed(qtys[0].0, 100), seed(qtys[1].0, 100)];
        let item_ids: Vec<CountItemId> = seeds.iter().map(|s| s.item_id).collect();

        let mut count = StockCount::empty(id);
        execute(&mut count, &schedule_cmd(tenant_id, id, seeds)).unwrap();
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::InProgress)).unwrap();
        execute(&mut count, &record_cmd(tenant_id, id, item_ids[0], qtys[0].1)).unwrap();
        execute(&mut count, &record_cmd(tenant_id, id, item_ids[1], qtys[1].1)).unwrap();
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::Review)).unwrap();

        (count, tenant_id, id, item_ids)
    }

    #[test]
    fn schedule_freezes_the_item_set() {
        let tenant_id = tenant();
        let id = count_id();
        let mut count = StockCount::empty(id);

        execute(&mut count, &schedule_cmd(tenant_id, id, vec![seed(10, 250), seed(0, 50)]))
            .unwrap();

        assert_eq!(count.status(), CountStatus::Draft);
        assert_eq!(count.total_items(), 2);
        assert_eq!(count.counted_items(), 0);
        assert_eq!(count.progress_percent(), 0.0);
        assert!(count.lines().iter().all(|l| l.status() == ItemStatus::Pending));
    }

    #[test]
    fn category_count_requires_category_id() {
        let tenant_id = tenant();
        let id = count_id();
        let count = StockCount::empty(id);

        let cmd = CountCommand::Schedule(ScheduleCount {
            tenant_id,
            count_id: id,
            sequence_no: "SC-0001".to_string(),
            count_type: CountType::Category,
            blind: false,
            count_date: now(),
            deadline: None,
            category_id: None,
            assigned_to: None,
            notes: None,
            lines: vec![seed(1, 1)],
            scheduled_by: actor(),
            occurred_at: now(),
        });

        assert_eq!(count.handle(&cmd).unwrap_err(), CountError::MissingCategory);
    }

    #[test]
    fn duplicate_products_are_rejected() {
        let tenant_id = tenant();
        let id = count_id();
        let count = StockCount::empty(id);

        let mut a = seed(1, 1);
        let mut b = seed(2, 2);
        b.product_id = a.product_id;
        a.item_id = CountItemId::new();
        b.item_id = CountItemId::new();

        let err = count
            .handle(&schedule_cmd(tenant_id, id, vec![a, b]))
            .unwrap_err();
        assert!(matches!(err, CountError::Validation(_)));
    }

    #[test]
    fn recording_requires_editable_status() {
        let tenant_id = tenant();
        let id = count_id();
        let s = seed(10, 100);
        let item = s.item_id;

        let mut count = StockCount::empty(id);
        execute(&mut count, &schedule_cmd(tenant_id, id, vec![s])).unwrap();
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::InProgress)).unwrap();
        execute(&mut count, &record_cmd(tenant_id, id, item, 10)).unwrap();
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::Review)).unwrap();

        let err = count
            .handle(&record_cmd(tenant_id, id, item, 9))
            .unwrap_err();
        assert_eq!(
            err,
            CountError::InvalidCountState {
                status: CountStatus::Review
            }
        );
    }

    #[test]
    fn negative_quantity_is_rejected() {
        let tenant_id = tenant();
        let id = count_id();
        let s = seed(10, 100);
        let item = s.item_id;

        let mut count = StockCount::empty(id);
        execute(&mut count, &schedule_cmd(tenant_id, id, vec![s])).unwrap();
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::InProgress)).unwrap();

        let err = count
            .handle(&record_cmd(tenant_id, id, item, -1))
            .unwrap_err();
        assert!(matches!(err, CountError::InvalidQuantity(_)));
    }

    #[test]
    fn unknown_item_is_rejected() {
        let tenant_id = tenant();
        let id = count_id();
        let mut count = StockCount::empty(id);
        execute(&mut count, &schedule_cmd(tenant_id, id, vec![seed(1, 1)])).unwrap();
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::InProgress)).unwrap();

        let stranger = CountItemId::new();
        let err = count
            .handle(&record_cmd(tenant_id, id, stranger, 4))
            .unwrap_err();
        assert_eq!(err, CountError::ItemNotFound(stranger));
    }

    #[test]
    fn rerecording_overwrites_with_exactly_one_line() {
        let tenant_id = tenant();
        let id = count_id();
        let s = seed(10, 100);
        let item = s.item_id;

        let mut count = StockCount::empty(id);
        execute(&mut count, &schedule_cmd(tenant_id, id, vec![s])).unwrap();
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::InProgress)).unwrap();
        execute(&mut count, &record_cmd(tenant_id, id, item, 12)).unwrap();

        let events = execute(&mut count, &record_cmd(tenant_id, id, item, 7)).unwrap();
        match &events[0] {
            CountEvent::LineRecorded(e) => {
                assert_eq!(e.previous_qty, Some(12));
                assert_eq!(e.counted_qty, 7);
            }
            other => panic!("expected LineRecorded, got {other:?}"),
        }

        assert_eq!(count.total_items(), 1);
        let line = count.line(item).unwrap();
        assert_eq!(line.counted_qty, Some(7));
        assert_eq!(line.variance.unwrap().qty, -3);
        assert_eq!(count.counted_items(), 1);
    }

    #[test]
    fn review_requires_full_progress() {
        let tenant_id = tenant();
        let id = count_id();
        let seeds = vec![seed(1, 1), seed(2, 1), seed(3, 1)];
        let item = seeds[0].item_id;

        let mut count = StockCount::empty(id);
        execute(&mut count, &schedule_cmd(tenant_id, id, seeds)).unwrap();
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::InProgress)).unwrap();
        execute(&mut count, &record_cmd(tenant_id, id, item, 1)).unwrap();

        let err = count
            .handle(&transition_cmd(tenant_id, id, CountStatus::Review))
            .unwrap_err();
        assert_eq!(err, CountError::IncompleteCount { counted: 1, total: 3 });
    }

    #[test]
    fn empty_count_cannot_reach_review() {
        let tenant_id = tenant();
        let id = count_id();

        let mut count = StockCount::empty(id);
        execute(&mut count, &schedule_cmd(tenant_id, id, Vec::new())).unwrap();
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::InProgress)).unwrap();

        assert_eq!(count.progress_percent(), 0.0);
        let err = count
            .handle(&transition_cmd(tenant_id, id, CountStatus::Review))
            .unwrap_err();
        assert_eq!(err, CountError::IncompleteCount { counted: 0, total: 0 });

        // Still cancellable, not orphaned.
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::Cancelled)).unwrap();
        assert_eq!(count.status(), CountStatus::Cancelled);
    }

    #[test]
    fn reject_preserves_recorded_quantities() {
        let (mut count, tenant_id, id, items) = count_in_review([(10, 8), (0, 3)]);

        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::InProgress)).unwrap();

        assert_eq!(count.status(), CountStatus::InProgress);
        assert_eq!(count.line(items[0]).unwrap().counted_qty, Some(8));
        assert_eq!(count.line(items[1]).unwrap().counted_qty, Some(3));
        assert_eq!(count.counted_items(), 2);
    }

    #[test]
    fn cancel_is_rejected_for_terminal_statuses() {
        let (mut count, tenant_id, id, items) = count_in_review([(5, 5), (5, 5)]);
        execute(&mut count, &approve_cmd(tenant_id, id, items[0])).unwrap();
        execute(&mut count, &approve_cmd(tenant_id, id, items[1])).unwrap();
        assert_eq!(count.status(), CountStatus::Completed);

        let err = count
            .handle(&transition_cmd(tenant_id, id, CountStatus::Cancelled))
            .unwrap_err();
        assert_eq!(
            err,
            CountError::InvalidTransition {
                from: CountStatus::Completed,
                to: CountStatus::Cancelled
            }
        );
    }

    #[test]
    fn approved_status_is_never_a_bare_flip() {
        let (count, tenant_id, id, _) = count_in_review([(5, 5), (5, 5)]);

        let err = count
            .handle(&transition_cmd(tenant_id, id, CountStatus::Approved))
            .unwrap_err();
        assert_eq!(
            err,
            CountError::InvalidTransition {
                from: CountStatus::Review,
                to: CountStatus::Approved
            }
        );
    }

    #[test]
    fn partial_approval_leaves_count_in_review() {
        let (mut count, tenant_id, id, items) = count_in_review([(10, 8), (0, 3)]);

        execute(&mut count, &approve_cmd(tenant_id, id, items[0])).unwrap();

        assert_eq!(count.status(), CountStatus::Review);
        assert!(count.line(items[0]).unwrap().is_approved());
        assert!(!count.line(items[1]).unwrap().is_approved());
    }

    #[test]
    fn final_approval_completes_the_count() {
        let (mut count, tenant_id, id, items) = count_in_review([(10, 8), (0, 3)]);

        execute(&mut count, &approve_cmd(tenant_id, id, items[0])).unwrap();
        let events = execute(&mut count, &approve_cmd(tenant_id, id, items[1])).unwrap();

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], CountEvent::LineApproved(_)));
        assert!(matches!(events[1], CountEvent::CountApproved(_)));
        assert!(matches!(events[2], CountEvent::CountCompleted(_)));
        assert_eq!(count.status(), CountStatus::Completed);
        assert!(count.all_approved());
    }

    #[test]
    fn double_approval_reports_already_approved() {
        let (mut count, tenant_id, id, items) = count_in_review([(10, 8), (0, 3)]);
        execute(&mut count, &approve_cmd(tenant_id, id, items[0])).unwrap();

        let err = count
            .handle(&approve_cmd(tenant_id, id, items[0]))
            .unwrap_err();
        assert_eq!(err, CountError::AlreadyApproved(items[0]));
        assert!(err.is_soft());
    }

    #[test]
    fn transition_log_captures_every_edge() {
        let (mut count, tenant_id, id, items) = count_in_review([(1, 1), (2, 2)]);
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::InProgress)).unwrap();
        execute(&mut count, &transition_cmd(tenant_id, id, CountStatus::Review)).unwrap();
        execute(&mut count, &approve_cmd(tenant_id, id, items[0])).unwrap();
        execute(&mut count, &approve_cmd(tenant_id, id, items[1])).unwrap();

        let edges: Vec<(CountStatus, CountStatus)> = count
            .transitions()
            .iter()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            edges,
            vec![
                (CountStatus::Draft, CountStatus::InProgress),
                (CountStatus::InProgress, CountStatus::Review),
                (CountStatus::Review, CountStatus::InProgress),
                (CountStatus::InProgress, CountStatus::Review),
                (CountStatus::Review, CountStatus::Approved),
                (CountStatus::Approved, CountStatus::Completed),
            ]
        );
    }

    #[test]
    fn summary_reflects_the_ledger() {
        let (count, ..) = count_in_review([(10, 8), (0, 3)]);
        let summary = count.summary();

        assert_eq!(summary.total_items, 2);
        assert_eq!(summary.counted_items, 2);
        assert_eq!(summary.items_with_variance, 2);
        // -2 * 100 + 3 * 100
        assert_eq!(summary.total_variance_value, 100);
        assert_eq!(summary.accuracy_percent, 0.0);
        assert_eq!(summary.by_category.major, 2);
        assert_eq!(summary.progress_percent(), 100.0);
    }

    #[test]
    fn exact_counts_stay_out_of_the_category_tally() {
        let (count, ..) = count_in_review([(10, 10), (0, 3)]);
        let summary = count.summary();

        assert_eq!(summary.counted_items, 2);
        assert_eq!(summary.items_with_variance, 1);
        let tally = summary.by_category;
        assert_eq!(tally.minor, 0);
        assert_eq!(tally.major, 1);
        assert_eq!(
            tally.minor + tally.moderate + tally.major,
            summary.items_with_variance
        );
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let (count, tenant_id, id, items) = count_in_review([(10, 8), (0, 3)]);
        let before = count.clone();

        let first = count.handle(&approve_cmd(tenant_id, id, items[0])).unwrap();
        let second = count.handle(&approve_cmd(tenant_id, id, items[0])).unwrap();

        assert_eq!(count, before);
        // Same decision both times, modulo the command timestamps.
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn apply_is_deterministic() {
        let (a, ..) = count_in_review([(10, 8), (0, 3)]);
        let (b, ..) = count_in_review([(10, 8), (0, 3)]);

        assert_eq!(a.status(), b.status());
        assert_eq!(a.version(), b.version());
        assert_eq!(a.counted_items(), b.counted_items());
    }
}
