//! Typed event channel decoupling producers (supervisor, tailer, rcon)
//! from consumers (metrics, audit, notifications).

pub mod bus;
pub mod event;
pub mod subscriber;

pub use bus::{BusStats, EventBus, Subscription};
pub use event::{Event, EventFilter, EventKind, EventPayload};
pub use subscriber::{LogSubscriber, Subscribe};
