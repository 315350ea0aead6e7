//! Control socket for a running warden.
//!
//! `warden run` hosts the orchestrator and a [`ControlServer`]; the other CLI
//! commands talk to it through a [`ControlClient`]. Messages are rkyv archives
//! behind a length prefix, one request per connection.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use protocol::{Request, Response, ServiceInfo, WireLogLine, WireState};
pub use server::ControlServer;
