//! Stock count domain module (event-sourced).
//!
//! Business rules for physical inventory counts: the count lifecycle state
//! machine, the per-item expected-vs-counted ledger, variance classification
//! and approval bookkeeping. Implemented purely as deterministic domain
//! logic (no IO, no HTTP, no storage).

pub mod count;
pub mod error;
pub mod summary;
pub mod variance;

pub use count::{
    ApproveLine, CountCommand, CountEvent, CountId, CountItemId, CountLine, CountScheduled,
    CountStatus, CountType, ItemCondition, ItemStatus, LineApproved, LineApprovalState,
    LineRecorded, LineSeed, RecordLine, RequestTransition, ScheduleCount, StatusChanged,
    StockCount, TransitionRecord, DEFAULT_COUNT_METHOD,
};
pub use error::CountError;
pub use summary::{CategoryTally, CountSummary};
pub use variance::{compute_variance, Variance, VarianceCategory, VariancePolicy};
