use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stocktally_core::{AggregateId, TenantId};

/// A committed event plus the stream metadata consumers need.
///
/// Envelopes are what travel on the bus and what projections consume:
/// `tenant_id` scopes every downstream write, `sequence_number` is the
/// event's position in its stream (starting at 1) and drives idempotency
/// cursors, and `payload` is the serialized domain event.
///
/// Fields are public; an envelope is a value, not an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub sequence_number: u64,
    pub payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            payload,
        }
    }

    /// Re-wrap the payload, keeping all stream metadata.
    pub fn map_payload<T>(self, f: impl FnOnce(E) -> T) -> EventEnvelope<T> {
        EventEnvelope {
            event_id: self.event_id,
            tenant_id: self.tenant_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            sequence_number: self.sequence_number,
            payload: f(self.payload),
        }
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
