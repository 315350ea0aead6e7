pub mod backoff;
pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod rcon;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod supervisor;
pub mod tailer;

pub use config::WardenConfig;
pub use error::{Result, WardenError};
pub use events::{Event, EventBus, EventFilter, EventKind, EventPayload, Subscription};
pub use orchestrator::Orchestrator;
pub use registry::ServiceRegistry;
pub use service::{Service, ServiceDescriptor, ServiceState};
