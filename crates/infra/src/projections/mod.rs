//! Projections: committed events in, derived views out.
//!
//! Projections consume `EventEnvelope<JsonValue>` (at-least-once delivery)
//! and must be idempotent. Each keeps a per-stream cursor and skips any
//! envelope whose sequence number it has already applied. All derived state
//! is disposable and can be rebuilt by replaying the stream.

mod count_overview;

pub use count_overview::{
    CountFacts, CountOverview, CountOverviewProjection, CountProjectionError, LineFacts,
};
