//! Non-blocking publish/subscribe bus.
//!
//! ```text
//! publish(ev) ──┬──► [queue A] ──► Subscription A (recv / stream / worker)
//!               ├──► [queue B] ──► Subscription B
//!               └──► [queue N] ──► ...
//! ```
//!
//! - `publish` never awaits; each queue is touched under a short lock.
//! - Each subscriber owns a bounded queue. When it is full the **oldest**
//!   queued event is discarded and the subscriber's drop counter increments.
//! - Events published by one producer reach every subscriber in publish order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::Stream;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::event::{Event, EventFilter};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct SubscriberQueue {
    name: String,
    filter: EventFilter,
    capacity: usize,
    queue: Mutex<VecDeque<Arc<Event>>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    /// Returns `true` when an older event had to be discarded.
    fn push(&self, event: Arc<Event>) -> bool {
        let evicted = {
            let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(event);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<Arc<Event>> {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }
}

struct BusInner {
    subscribers: RwLock<Vec<Arc<SubscriberQueue>>>,
    default_capacity: usize,
    published: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Point-in-time counters for observability collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    pub subscribers: usize,
    pub published: u64,
    pub dropped: u64,
}

/// Cloneable handle to a shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// `capacity` is the default per-subscriber queue size (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                default_capacity: capacity.max(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn publish(&self, event: Event) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let kind = event.kind();
        let event = Arc::new(event);
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let mut saw_closed = false;
        {
            let subs = self.inner.subscribers.read().unwrap_or_else(|p| p.into_inner());
            for sub in subs.iter() {
                if sub.closed.load(Ordering::Acquire) {
                    saw_closed = true;
                    continue;
                }
                if !sub.filter.matches(kind) {
                    continue;
                }
                if sub.push(Arc::clone(&event)) {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(subscriber = %sub.name, seq = event.seq, "Subscriber queue full, dropped oldest event");
                }
            }
        }

        if saw_closed {
            self.prune();
        }
    }

    pub fn subscribe(&self, filter: impl Into<EventFilter>) -> Subscription {
        self.subscribe_with("anonymous", filter, self.inner.default_capacity)
    }

    /// Subscribe with an explicit name (for logs) and queue capacity.
    pub fn subscribe_with(
        &self,
        name: impl Into<String>,
        filter: impl Into<EventFilter>,
        capacity: usize,
    ) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            name: name.into(),
            filter: filter.into(),
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        debug!(subscriber = %queue.name, capacity = queue.capacity, "New bus subscription");
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::clone(&queue));
        Subscription {
            queue,
            bus: Arc::clone(&self.inner),
        }
    }

    pub fn stats(&self) -> BusStats {
        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|s| !s.closed.load(Ordering::Acquire))
            .count();
        BusStats {
            subscribers,
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting events. Subscribers drain what is queued, then see `None`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let subs = self.inner.subscribers.read().unwrap_or_else(|p| p.into_inner());
        for sub in subs.iter() {
            sub.notify.notify_one();
        }
    }

    fn prune(&self) {
        let mut subs = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner());
        subs.retain(|s| !s.closed.load(Ordering::Acquire));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the bus is closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            if let Some(ev) = self.queue.pop() {
                return Some(ev);
            }
            if self.bus.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.queue.pop()
    }

    /// Events discarded for this subscriber because its queue overflowed.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.queue.name
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Event>> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|ev| (ev, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
    }
}
