use stocktally_core::AggregateId;

/// A command targets a specific aggregate (command abstraction).
///
/// Commands represent **intent** - a request to change a count. They are
/// transient (never persisted) and are transformed into events (which are).
/// A command is rejected if invalid; an event is an accepted fact.
///
/// Tenant isolation is enforced at the event level (envelopes), not here:
/// commands stay domain-focused while infrastructure attaches the tenant
/// context during persistence.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
