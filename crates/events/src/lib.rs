//! Event abstractions for the count engine.
//!
//! Mechanics only: what an event is, how it is enveloped for distribution,
//! and how commands are executed against aggregates. No storage, no IO.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use command::Command;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::{execute, CommandHandler};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
