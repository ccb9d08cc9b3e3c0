//! Audit events and their in-process transport.
//!
//! Allocation writes are committed first and published afterwards; the bus is a
//! distribution mechanism, never a source of truth.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
