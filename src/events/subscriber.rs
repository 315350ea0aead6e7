//! Handler-style subscribers driven by a dedicated worker task.
//!
//! Each handler gets its own bounded queue on the bus and its own worker, so a
//! slow or panicking handler only ever hurts itself.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bus::{EventBus, DEFAULT_QUEUE_CAPACITY};
use super::event::{Event, EventFilter, EventPayload};

#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Called sequentially, in publish order, from the worker task.
    async fn on_event(&self, event: &Event);

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn filter(&self) -> EventFilter {
        EventFilter::all()
    }

    fn queue_capacity(&self) -> usize {
        DEFAULT_QUEUE_CAPACITY
    }
}

impl EventBus {
    /// Spawns a worker that feeds `handler` until the bus is closed.
    pub fn spawn_subscriber(&self, handler: Arc<dyn Subscribe>) -> JoinHandle<()> {
        let mut sub = self.subscribe_with(handler.name(), handler.filter(), handler.queue_capacity());
        tokio::spawn(async move {
            while let Some(ev) = sub.recv().await {
                let fut = handler.on_event(ev.as_ref());
                if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                    let info = if let Some(msg) = panic.downcast_ref::<&'static str>() {
                        (*msg).to_string()
                    } else if let Some(msg) = panic.downcast_ref::<String>() {
                        msg.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    error!(subscriber = handler.name(), seq = ev.seq, panic = %info, "Subscriber panicked");
                }
            }
            debug!(subscriber = handler.name(), dropped = sub.dropped(), "Subscriber worker finished");
        })
    }
}

/// Mirrors bus events into the tracing log.
pub struct LogSubscriber;

#[async_trait]
impl Subscribe for LogSubscriber {
    async fn on_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::ProcessStarted { pid, restart } => {
                info!(seq = event.seq, pid = ?pid, restart, "Server process started");
            }
            EventPayload::ProcessCrashed {
                pid,
                exit_code,
                signal,
                uptime_ms,
            } => {
                warn!(seq = event.seq, pid = ?pid, exit_code = ?exit_code, signal = ?signal, uptime_ms, "Server process crashed");
            }
            EventPayload::ProcessStopped {
                pid,
                exit_code,
                forced,
            } => {
                info!(seq = event.seq, pid = ?pid, exit_code = ?exit_code, forced, "Server process stopped");
            }
            EventPayload::ProcessStuck {
                pid,
                cpu_percent,
                samples,
            } => {
                warn!(seq = event.seq, pid = ?pid, cpu_percent, samples, "Server process possibly stuck");
            }
            EventPayload::LogLine { source, line, .. } => {
                debug!(seq = event.seq, source = %source, "{}", line);
            }
            EventPayload::RconConnected { endpoint } => {
                info!(seq = event.seq, endpoint = %endpoint, "RCON connected");
            }
            EventPayload::RconDisconnected { endpoint, reason } => {
                warn!(seq = event.seq, endpoint = %endpoint, reason = %reason, "RCON disconnected");
            }
            EventPayload::RconMessage { message } => {
                info!(seq = event.seq, "RCON: {}", message);
            }
            EventPayload::ServiceStateChanged {
                service,
                from,
                to,
                reason,
            } => {
                info!(
                    seq = event.seq,
                    service = %service,
                    from = from.as_str(),
                    to = to.as_str(),
                    reason = ?reason,
                    "Service state changed"
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
