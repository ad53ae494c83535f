//! Infrastructure and application layer for the count engine.
//!
//! Everything here composes the pure domain (`stocktally-counts`) with
//! storage, distribution and external collaborators: the append-only event
//! store, the command dispatch pipeline, read-model projections, the stock
//! adjustment gateway, the count strategy resolver, the approval processor,
//! and the `CountService` operation surface.

pub mod approval;
pub mod command_dispatcher;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod service;
pub mod stock_gateway;
pub mod strategy;


pub use approval::{
    process_approval, ApprovalError, ApprovalItemError, ApprovalOutcome, ApprovalRequest,
    ItemFailure, COUNT_AGGREGATE_TYPE,
};
pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent};
pub use projections::{CountFacts, CountOverview, CountOverviewProjection, CountProjectionError, LineFacts};
pub use read_model::{InMemoryTenantStore, TenantStore};
pub use service::{
    BulkRecordOutcome, BulkRejection, CountAnalytics, CountDetail, CountPage, CountService,
    CreateCountRequest, DetailView, LineView, ListFilter, RecordItemRequest, ServiceError,
    VarianceReport, VarianceRow,
};
pub use stock_gateway::{
    AdjustmentReceipt, InMemoryStockGateway, RetryPolicy, RetryingStockGateway, StockGateway,
    StockGatewayError,
};
pub use strategy::{ScopeError, ScopeRequest, ScopeResolver, CYCLE_LOOKBACK_DAYS, SPOT_SAMPLE_PERCENT};
