//! Ledger events: the `Event` contract, envelopes and the pub/sub bus used for
//! the batch audit stream and the operator reconciliation queue.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
