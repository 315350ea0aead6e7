//! Event envelope published on the [`EventBus`](super::EventBus).
//!
//! Every event carries a global sequence number and a wall-clock timestamp.
//! The payload determines the [`EventKind`], which is what subscribers filter on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::service::ServiceState;

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of events, used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    ProcessStarted,
    ProcessCrashed,
    ProcessStopped,
    ProcessStuck,
    LogLine,
    RconConnected,
    RconDisconnected,
    RconMessage,
    ServiceStateChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::ProcessStarted,
        EventKind::ProcessCrashed,
        EventKind::ProcessStopped,
        EventKind::ProcessStuck,
        EventKind::LogLine,
        EventKind::RconConnected,
        EventKind::RconDisconnected,
        EventKind::RconMessage,
        EventKind::ServiceStateChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ProcessStarted => "process_started",
            EventKind::ProcessCrashed => "process_crashed",
            EventKind::ProcessStopped => "process_stopped",
            EventKind::ProcessStuck => "process_stuck",
            EventKind::LogLine => "log_line",
            EventKind::RconConnected => "rcon_connected",
            EventKind::RconDisconnected => "rcon_disconnected",
            EventKind::RconMessage => "rcon_message",
            EventKind::ServiceStateChanged => "service_state_changed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payload. One variant per [`EventKind`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    ProcessStarted {
        pid: Option<u32>,
        /// 0 for the initial launch, incremented on each automatic restart.
        restart: u32,
    },
    ProcessCrashed {
        pid: Option<u32>,
        exit_code: Option<i32>,
        signal: Option<i32>,
        uptime_ms: u64,
    },
    ProcessStopped {
        pid: Option<u32>,
        exit_code: Option<i32>,
        /// The process ignored the cooperative signal and was killed.
        forced: bool,
    },
    /// The process is alive but has spent almost no CPU for several polls.
    ProcessStuck {
        pid: Option<u32>,
        /// Mean CPU usage over the sampled window.
        cpu_percent: f32,
        samples: u32,
    },
    LogLine {
        source: String,
        line: String,
        /// Byte offset in the file where the line starts.
        offset: u64,
    },
    RconConnected {
        endpoint: String,
    },
    RconDisconnected {
        endpoint: String,
        reason: String,
    },
    RconMessage {
        message: String,
    },
    ServiceStateChanged {
        service: String,
        from: ServiceState,
        to: ServiceState,
        reason: Option<String>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ProcessStarted { .. } => EventKind::ProcessStarted,
            EventPayload::ProcessCrashed { .. } => EventKind::ProcessCrashed,
            EventPayload::ProcessStopped { .. } => EventKind::ProcessStopped,
            EventPayload::ProcessStuck { .. } => EventKind::ProcessStuck,
            EventPayload::LogLine { .. } => EventKind::LogLine,
            EventPayload::RconConnected { .. } => EventKind::RconConnected,
            EventPayload::RconDisconnected { .. } => EventKind::RconDisconnected,
            EventPayload::RconMessage { .. } => EventKind::RconMessage,
            EventPayload::ServiceStateChanged { .. } => EventKind::ServiceStateChanged,
        }
    }
}

/// Immutable event envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn state_changed(
        service: impl Into<String>,
        from: ServiceState,
        to: ServiceState,
        reason: Option<String>,
    ) -> Self {
        Self::new(EventPayload::ServiceStateChanged {
            service: service.into(),
            from,
            to,
            reason,
        })
    }

    pub fn log_line(source: impl Into<String>, line: impl Into<String>, offset: u64) -> Self {
        Self::new(EventPayload::LogLine {
            source: source.into(),
            line: line.into(),
            offset,
        })
    }

    pub fn rcon_message(message: impl Into<String>) -> Self {
        Self::new(EventPayload::RconMessage {
            message: message.into(),
        })
    }
}

/// Which event kinds a subscriber wants. The default accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    kinds: Option<HashSet<EventKind>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self { kinds: None }
    }

    pub fn kinds<I>(kinds: I) -> Self
    where
        I: IntoIterator<Item = EventKind>,
    {
        Self {
            kinds: Some(kinds.into_iter().collect()),
        }
    }

    pub fn matches(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().is_none_or(|k| k.contains(&kind))
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        Self::kinds([kind])
    }
}
