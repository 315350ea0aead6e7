//! Incremental log file consumption.
//!
//! One poll task drives a [`LogCursor`] per configured source. Every complete
//! line is recorded in the source's [`LogHistory`] and published as a
//! `LogLine` event.

mod cursor;
mod history;
mod source;

pub use cursor::{Fingerprint, LogCursor, Poll, TailedLine, HEAD_SAMPLE_LEN};
pub use history::{LogEntry, LogHistory, DEFAULT_HISTORY_LINES};
pub use source::LogSource;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::events::{Event, EventBus};
use crate::service::{Service, ServiceState};

/// A named log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailSource {
    pub name: String,
    pub source: LogSource,
}

impl TailSource {
    pub fn new(name: impl Into<String>, source: LogSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TailerSettings {
    pub poll_interval: Duration,
    pub history_lines: usize,
}

impl Default for TailerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            history_lines: DEFAULT_HISTORY_LINES,
        }
    }
}

struct Worker {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct LogTailer {
    name: String,
    sources: Arc<Vec<TailSource>>,
    settings: TailerSettings,
    bus: EventBus,
    history: Arc<LogHistory>,
    worker: Mutex<Option<Worker>>,
    /// Token of the running worker, reachable from the non-async `kill`.
    current: StdMutex<Option<CancellationToken>>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl LogTailer {
    pub fn new(sources: Vec<TailSource>, settings: TailerSettings, bus: EventBus) -> Self {
        let history = Arc::new(LogHistory::new(settings.history_lines));
        Self {
            name: "logs".to_string(),
            sources: Arc::new(sources),
            settings,
            bus,
            history,
            worker: Mutex::new(None),
            current: StdMutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(|s| s.name.as_str())
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.sources.iter().any(|s| s.name == name)
    }

    /// History entries of `source` newer than `since`; `None` for an unknown source.
    pub fn fetch(&self, source: &str, since: Option<DateTime<Utc>>) -> Option<Vec<LogEntry>> {
        self.has_source(source)
            .then(|| self.history.fetch(source, since))
    }

    /// The last `n` history entries of `source`; `None` for an unknown source.
    pub fn tail(&self, source: &str, n: usize) -> Option<Vec<LogEntry>> {
        self.has_source(source).then(|| self.history.tail(source, n))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn spawn(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        for source in self.sources.iter() {
            self.history.clear(&source.name);
        }
        let token = self.shutdown.child_token();
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(token.clone());
        self.running.store(true, Ordering::Release);
        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.sources),
            self.settings.poll_interval,
            self.bus.clone(),
            Arc::clone(&self.history),
            Arc::clone(&self.running),
            token.clone(),
        ));
        info!(sources = self.sources.len(), interval = ?self.settings.poll_interval, "Log tailer started");
        *worker = Some(Worker { token, task });
    }

    async fn halt(&self) {
        let mut worker = self.worker.lock().await;
        if let Some(w) = worker.take() {
            w.token.cancel();
            if let Err(e) = w.task.await {
                warn!(error = %e, "Log tailer task ended abnormally");
            }
            info!("Log tailer stopped");
        }
        self.current.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.running.store(false, Ordering::Release);
    }
}

#[async_trait]
impl Service for LogTailer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.spawn().await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.halt().await;
        Ok(())
    }

    fn kill(&self) {
        if let Some(token) = self
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            token.cancel();
        }
    }

    fn state(&self) -> ServiceState {
        if self.is_running() {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        }
    }
}

async fn poll_loop(
    sources: Arc<Vec<TailSource>>,
    interval: Duration,
    bus: EventBus,
    history: Arc<LogHistory>,
    running: Arc<AtomicBool>,
    token: CancellationToken,
) {
    let mut cursors: Vec<Option<LogCursor>> = sources.iter().map(|_| None).collect();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => break,
        }
        for (source, cursor) in sources.iter().zip(cursors.iter_mut()) {
            poll_source(source, cursor, &bus, &history).await;
        }
    }
    running.store(false, Ordering::Release);
}

async fn poll_source(
    source: &TailSource,
    cursor: &mut Option<LogCursor>,
    bus: &EventBus,
    history: &LogHistory,
) {
    let path = match source.source.resolve().await {
        Ok(Some(path)) => path,
        Ok(None) => return,
        Err(e) => {
            warn!(source = %source.name, error = %e, "Failed to resolve log source");
            return;
        }
    };

    if cursor.as_ref().is_none_or(|c| c.path() != path.as_path()) {
        if let Some(old) = cursor.as_ref() {
            info!(source = %source.name, from = %old.path().display(), to = %path.display(), "Following newer log file");
        } else {
            debug!(source = %source.name, path = %path.display(), "Tailing log file");
        }
        *cursor = Some(LogCursor::new(path));
    }
    let Some(cursor) = cursor.as_mut() else {
        return;
    };

    let poll = match cursor.poll().await {
        Ok(poll) => poll,
        Err(e) => {
            warn!(source = %source.name, path = %cursor.path().display(), error = %e, "Failed to read log file");
            return;
        }
    };
    for tailed in poll.lines {
        if tailed.line.is_empty() {
            continue;
        }
        history.push(
            &source.name,
            LogEntry {
                timestamp: Utc::now(),
                offset: tailed.offset,
                line: tailed.line.clone(),
            },
        );
        bus.publish(Event::log_line(&source.name, tailed.line, tailed.offset));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, EventPayload};
    use std::io::Write;

    fn append(path: &std::path::Path, data: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    fn tailer(dir: &std::path::Path, bus: EventBus) -> LogTailer {
        LogTailer::new(
            vec![
                TailSource::new("ADM", LogSource::newest(dir, None, Some(".adm"))),
                TailSource::new("custom", LogSource::File(dir.join("custom.txt"))),
            ],
            TailerSettings {
                poll_interval: Duration::from_millis(20),
                history_lines: 100,
            },
            bus,
        )
    }

    async fn next_line(sub: &mut crate::events::Subscription) -> (String, String) {
        let ev = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        match &ev.payload {
            EventPayload::LogLine { source, line, .. } => (source.clone(), line.clone()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn publishes_lines_and_records_history() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventKind::LogLine);
        let tailer = tailer(dir.path(), bus);

        tailer.start().await.unwrap();
        assert_eq!(Service::state(&tailer), ServiceState::Running);

        append(&dir.path().join("server_1.ADM"), "joined\n\nleft\n");
        assert_eq!(next_line(&mut sub).await, ("ADM".into(), "joined".into()));
        assert_eq!(next_line(&mut sub).await, ("ADM".into(), "left".into()));

        append(&dir.path().join("custom.txt"), "hello\n");
        assert_eq!(next_line(&mut sub).await, ("custom".into(), "hello".into()));

        let adm: Vec<String> = tailer.fetch("ADM", None).unwrap().into_iter().map(|e| e.line).collect();
        assert_eq!(adm, vec!["joined", "left"]);
        assert!(tailer.fetch("nope", None).is_none());

        tailer.stop().await.unwrap();
        assert_eq!(Service::state(&tailer), ServiceState::Stopped);
        // history survives a stop
        assert_eq!(tailer.tail("custom", 5).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn switches_to_newer_file() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let mut sub = bus.subscribe(EventKind::LogLine);
        let tailer = tailer(dir.path(), bus);

        let old = dir.path().join("a.adm");
        append(&old, "from old\n");
        {
            let f = std::fs::File::options().write(true).open(&old).unwrap();
            f.set_modified(std::time::SystemTime::now() - Duration::from_secs(60))
                .unwrap();
        }
        tailer.start().await.unwrap();
        assert_eq!(next_line(&mut sub).await.1, "from old");

        append(&dir.path().join("b.adm"), "from new\n");
        assert_eq!(next_line(&mut sub).await.1, "from new");
        tailer.stop().await.unwrap();
    }
}
