//! Count-domain error taxonomy.

use thiserror::Error;

use crate::count::{CountItemId, CountStatus};

/// Deterministic failures of count-domain operations.
///
/// Validation errors (`InvalidQuantity`, `MissingCategory`, `ItemNotFound`,
/// `ItemNotCounted`) are client-correctable; state errors (`InvalidCountState`,
/// `InvalidTransition`, `IncompleteCount`) report the authoritative status the
/// caller raced against. `AlreadyApproved` is deliberately a *soft* outcome:
/// the approval processor reports it and moves on, so retries stay idempotent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CountError {
    /// A count already exists under this identifier.
    #[error("count already exists")]
    AlreadyExists,

    /// The count does not exist (empty stream).
    #[error("count not found")]
    NotFound,

    /// Counted quantity was missing or negative.
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    /// A category count was requested without a category.
    #[error("category count requires a category id")]
    MissingCategory,

    /// The item does not belong to this count.
    #[error("item {0} does not belong to this count")]
    ItemNotFound(CountItemId),

    /// The item has no counted quantity yet.
    #[error("item {0} has not been counted")]
    ItemNotCounted(CountItemId),

    /// The count is not editable in its current status.
    #[error("count is not editable in status '{status}'")]
    InvalidCountState { status: CountStatus },

    /// The requested lifecycle transition is not allowed.
    #[error("invalid transition from '{from}' to '{to}'")]
    InvalidTransition { from: CountStatus, to: CountStatus },

    /// Review was requested before every item was counted.
    #[error("count is incomplete: {counted} of {total} items counted")]
    IncompleteCount { counted: usize, total: usize },

    /// The item already carries an approval (safe to ignore on retry).
    #[error("item {0} is already approved")]
    AlreadyApproved(CountItemId),

    /// A value failed validation.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl CountError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_quantity(msg: impl Into<String>) -> Self {
        Self::InvalidQuantity(msg.into())
    }

    /// Whether a retry of the same request can succeed without the caller
    /// changing anything. Only concurrency-adjacent states qualify.
    pub fn is_soft(&self) -> bool {
        matches!(self, CountError::AlreadyApproved(_))
    }
}
