//! One authenticated RCON connection.
//!
//! The send path and the reader task share only the pending table, guarded by
//! a std mutex that is never held across an await. A session that closes
//! fails every pending request at once with `Connection`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::protocol::{check_len, read_frame, write_frame, Frame, FrameType};
use super::ConnectionState;
use crate::error::RconError;
use crate::events::{Event, EventBus};

type Reply = oneshot::Sender<Result<String, RconError>>;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_missed_heartbeats: u32,
    pub max_protocol_errors: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
            max_missed_heartbeats: 2,
            max_protocol_errors: 10,
        }
    }
}

#[derive(Default)]
struct Pending {
    waiters: BTreeMap<u32, Reply>,
    closed: bool,
}

/// Sequence id → waiting caller.
#[derive(Default)]
pub(crate) struct PendingTable {
    inner: StdMutex<Pending>,
}

impl PendingTable {
    fn insert(&self, seq: u32, reply: Reply) -> Result<(), RconError> {
        let mut pending = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if pending.closed {
            return Err(RconError::NotConnected);
        }
        pending.waiters.insert(seq, reply);
        Ok(())
    }

    /// `false` when nobody is waiting for `seq`.
    fn resolve(&self, seq: u32, result: Result<String, RconError>) -> bool {
        let reply = self
            .inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .waiters
            .remove(&seq);
        match reply {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn remove(&self, seq: u32) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .waiters
            .remove(&seq);
    }

    fn fail_all(&self, err: RconError) -> usize {
        let waiters = {
            let mut pending = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            pending.closed = true;
            std::mem::take(&mut pending.waiters)
        };
        let n = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(Err(err.clone()));
        }
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .waiters
            .len()
    }
}

/// Removes the pending entry if the caller gives up (timeout, cancel, drop).
struct PendingGuard<'a> {
    table: &'a PendingTable,
    seq: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.seq);
    }
}

pub(crate) struct Session {
    endpoint: String,
    settings: SessionSettings,
    bus: EventBus,
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingTable,
    next_seq: AtomicU32,
    last_rx: StdMutex<Instant>,
    last_heartbeat_at: StdMutex<Option<Instant>>,
    /// Cancelled when the session closes for any reason.
    token: CancellationToken,
    /// Client-wide shutdown; in-flight requests end with `Cancelled`.
    shutdown: CancellationToken,
    close_reason: StdMutex<Option<String>>,
}

impl Session {
    /// Connects, authenticates and spawns the reader and heartbeat tasks.
    pub(crate) async fn open(
        endpoint: &str,
        password: &str,
        settings: SessionSettings,
        bus: EventBus,
        shutdown: &CancellationToken,
        state: &watch::Sender<ConnectionState>,
    ) -> Result<Arc<Session>, RconError> {
        let timeout = settings.connect_timeout;
        state.send_replace(ConnectionState::Connecting);
        debug!(endpoint, "Connecting to RCON");

        let stream = tokio::select! {
            res = tokio::time::timeout(timeout, TcpStream::connect(endpoint)) => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(RconError::Connection(format!("{}: {}", endpoint, e))),
                Err(_) => return Err(RconError::Timeout(timeout)),
            },
            _ = shutdown.cancelled() => return Err(RconError::Cancelled),
        };
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        state.send_replace(ConnectionState::Authenticating);
        let auth = async {
            write_frame(&mut writer, &Frame::request(FrameType::Auth, 0, password)).await?;
            await_auth(&mut reader).await
        };
        let accepted = tokio::select! {
            res = tokio::time::timeout(timeout, auth) => match res {
                Ok(res) => res?,
                Err(_) => return Err(RconError::Timeout(timeout)),
            },
            _ = shutdown.cancelled() => return Err(RconError::Cancelled),
        };
        if !accepted {
            warn!(endpoint, "RCON authentication rejected");
            return Err(RconError::Auth);
        }

        let session = Arc::new(Session {
            endpoint: endpoint.to_string(),
            settings,
            bus,
            writer: Mutex::new(writer),
            pending: PendingTable::default(),
            next_seq: AtomicU32::new(1),
            last_rx: StdMutex::new(Instant::now()),
            last_heartbeat_at: StdMutex::new(None),
            token: shutdown.child_token(),
            shutdown: shutdown.clone(),
            close_reason: StdMutex::new(None),
        });
        tokio::spawn(reader_loop(Arc::clone(&session), reader));
        tokio::spawn(heartbeat_loop(Arc::clone(&session)));
        info!(endpoint, "RCON session authenticated");
        Ok(session)
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends a request and waits for the response carrying the same sequence id.
    ///
    /// `timeout` bounds the whole call: waiting for the writer, writing the
    /// frame and waiting for the reply. A write abandoned part-way closes the
    /// session since the stream is no longer aligned.
    pub(crate) async fn request(
        &self,
        kind: FrameType,
        payload: &str,
        timeout: Duration,
    ) -> Result<String, RconError> {
        let deadline = tokio::time::Instant::now() + timeout;
        if self.token.is_cancelled() {
            return Err(RconError::NotConnected);
        }
        let seq = self.allocate_seq();
        let frame = Frame::request(kind, seq, payload);
        check_len(&frame)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx)?;
        let _guard = PendingGuard {
            table: &self.pending,
            seq,
        };

        let writing = AtomicBool::new(false);
        let write = async {
            let mut writer = self.writer.lock().await;
            writing.store(true, Ordering::Release);
            write_frame(&mut *writer, &frame).await
        };
        let written = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(RconError::Cancelled),
            _ = self.token.cancelled() => Err(RconError::Connection("session closed".into())),
            res = tokio::time::timeout_at(deadline, write) => match res {
                Ok(res) => res,
                Err(_) => Err(RconError::Timeout(timeout)),
            },
        };
        if let Err(e) = written {
            if writing.load(Ordering::Acquire) {
                self.close(format!("write failed: {}", e));
            }
            if matches!(e, RconError::Timeout(_)) {
                debug!(seq, timeout = ?timeout, "RCON request timed out while writing");
            }
            return Err(e);
        }
        trace!(seq, kind = ?kind, "Sent RCON request");

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(RconError::Cancelled),
            res = tokio::time::timeout_at(deadline, rx) => match res {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(RconError::Connection("session closed".into())),
                Err(_) => {
                    debug!(seq, timeout = ?timeout, "RCON request timed out");
                    Err(RconError::Timeout(timeout))
                }
            },
        }
    }

    /// Idempotent. The first reason wins.
    pub(crate) fn close(&self, reason: impl Into<String>) {
        {
            let mut slot = self.close_reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.into());
        }
        let reason = self.close_reason().unwrap_or_default();
        let failed = self
            .pending
            .fail_all(RconError::Connection(format!("disconnected: {}", reason)));
        self.token.cancel();
        debug!(endpoint = %self.endpoint, reason = %reason, failed, "RCON session closed");
    }

    pub(crate) async fn closed(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub(crate) fn last_heartbeat_at(&self) -> Option<Instant> {
        *self.last_heartbeat_at.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn allocate_seq(&self) -> u32 {
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    fn touch(&self) {
        *self.last_rx.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }
}

async fn await_auth(reader: &mut OwnedReadHalf) -> Result<bool, RconError> {
    loop {
        match read_frame(reader).await {
            Ok(frame) if frame.kind == FrameType::AuthResponse => return Ok(frame.auth_accepted()),
            Ok(frame) => trace!(kind = ?frame.kind, "Ignoring frame before auth response"),
            Err(RconError::Protocol(msg)) => warn!(error = %msg, "Malformed frame during auth"),
            Err(e) => return Err(e),
        }
    }
}

async fn reader_loop(session: Arc<Session>, mut reader: OwnedReadHalf) {
    let mut protocol_errors = 0u32;
    loop {
        let frame = tokio::select! {
            res = read_frame(&mut reader) => res,
            _ = session.token.cancelled() => return,
        };
        match frame {
            Ok(frame) => {
                session.touch();
                dispatch(&session, frame);
            }
            Err(RconError::Protocol(msg)) => {
                protocol_errors += 1;
                warn!(endpoint = %session.endpoint, error = %msg, count = protocol_errors, "Discarded malformed RCON frame");
                if protocol_errors >= session.settings.max_protocol_errors {
                    session.close(format!("{} malformed frames", protocol_errors));
                    return;
                }
            }
            Err(e) => {
                session.close(e.to_string());
                return;
            }
        }
    }
}

fn dispatch(session: &Session, frame: Frame) {
    match (frame.kind, frame.seq) {
        (FrameType::Async, _) => {
            trace!(message = %frame.payload, "RCON async message");
            session.bus.publish(Event::rcon_message(frame.payload));
        }
        (FrameType::CommandResponse | FrameType::Heartbeat | FrameType::AuthResponse, Some(seq)) => {
            if !session.pending.resolve(seq, Ok(frame.payload)) {
                debug!(seq, kind = ?frame.kind, "Discarding RCON response with no pending request");
            }
        }
        (kind, seq) => {
            warn!(kind = ?kind, seq = ?seq, "Unexpected RCON frame from server");
        }
    }
}

async fn heartbeat_loop(session: Arc<Session>) {
    let interval = session.settings.heartbeat_interval;
    let mut missed = 0u32;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = session.token.cancelled() => return,
        }
        if session.idle_for() < interval {
            continue;
        }
        match session
            .request(FrameType::Heartbeat, "", session.settings.heartbeat_timeout)
            .await
        {
            Ok(_) => {
                missed = 0;
                *session
                    .last_heartbeat_at
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
            }
            Err(RconError::Timeout(_)) => {
                missed += 1;
                warn!(endpoint = %session.endpoint, missed, "RCON heartbeat missed");
                if missed >= session.settings.max_missed_heartbeats {
                    session.close(format!("{} consecutive heartbeats missed", missed));
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_hits_only_matching_entry() {
        let table = PendingTable::default();
        let (tx7, rx7) = oneshot::channel();
        let (tx8, mut rx8) = oneshot::channel();
        table.insert(7, tx7).unwrap();
        table.insert(8, tx8).unwrap();

        assert!(!table.resolve(99, Ok("stray".into())));
        assert!(table.resolve(7, Ok("seven".into())));
        assert_eq!(rx7.await.unwrap().unwrap(), "seven");
        assert!(rx8.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn fail_all_closes_table() {
        let table = PendingTable::default();
        let (tx, rx) = oneshot::channel();
        table.insert(1, tx).unwrap();
        assert_eq!(table.fail_all(RconError::Connection("reset".into())), 1);
        assert!(matches!(rx.await.unwrap(), Err(RconError::Connection(_))));

        let (late, _rx) = oneshot::channel();
        assert_eq!(table.insert(2, late), Err(RconError::NotConnected));
    }

    #[test]
    fn guard_removes_entry() {
        let table = PendingTable::default();
        let (tx, _rx) = oneshot::channel();
        table.insert(3, tx).unwrap();
        {
            let _guard = PendingGuard {
                table: &table,
                seq: 3,
            };
        }
        assert_eq!(table.len(), 0);
    }
}
