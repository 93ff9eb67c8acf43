//! Committed events as they cross a bounded-context boundary.
//!
//! - `CommittedEvent` / `CommittedEventStream`: the unit of delivery
//! - `InterestSet` + `GenerationMatch`: the subscription predicate
//! - `EventBus`: local hand-off of received streams to consumers
//! - `EventHorizonIngress`: the seam the event store publishes through

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod ingress;
pub mod interest;
pub mod stream;

pub use bus::{EventBus, Subscription};
pub use event::CommittedEvent;
pub use in_memory_bus::{DEFAULT_SUBSCRIBER_CAPACITY, InMemoryBusError, InMemoryEventBus};
pub use ingress::EventHorizonIngress;
pub use interest::{GenerationMatch, InterestSet};
pub use stream::CommittedEventStream;
