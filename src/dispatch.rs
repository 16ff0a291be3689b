use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::core::{Event, Severity, StatsSnapshot, ThreatDetection, Transaction};
use crate::error::{EngineError, Result};

/// Per-subscription event filter, fixed for the subscription's lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionFilter {
    /// Drop transactions not addressed to a tracked contract.
    pub tracked_only: bool,
    /// Drop detections below this severity.
    pub min_severity: Option<Severity>,
    /// Case-insensitive method allow-list. Empty allows everything.
    pub methods: Vec<String>,
}

impl SubscriptionFilter {
    fn method_allowed(&self, method: Option<&str>) -> bool {
        if self.methods.is_empty() {
            return true;
        }
        method.is_some_and(|m| self.methods.iter().any(|allowed| allowed.eq_ignore_ascii_case(m)))
    }

    fn accepts(&self, event: &Event, tracked: bool, method: Option<&str>) -> bool {
        match event {
            Event::Stats(_) => true,
            Event::Transaction(_) => (!self.tracked_only || tracked) && self.method_allowed(method),
            Event::ThreatDetection(d) => {
                self.min_severity.is_none_or(|min| d.severity >= min) && self.method_allowed(method)
            }
        }
    }
}

struct Slot {
    id: u64,
    filter: SubscriptionFilter,
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    ended: AtomicBool,
    dropped: AtomicU64,
}

impl Slot {
    /// Enqueue without blocking; a full queue loses its oldest event.
    fn offer(&self, event: Event) -> Result<()> {
        let overflowed = {
            let mut queue = self.queue.lock();
            let overflowed = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(event);
            overflowed
        };
        self.notify.notify_one();
        if overflowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::SubscriberOverloaded(self.id));
        }
        Ok(())
    }

    fn end(&self) {
        self.ended.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct Inner {
    slots: RwLock<Vec<Arc<Slot>>>,
    next_id: AtomicU64,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Fans events out to subscribers through per-subscriber bounded queues.
///
/// Publishing never blocks on a subscriber: a subscriber that falls behind
/// loses its oldest queued events and the loss is counted.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(EngineError::DispatcherClosed);
        }
        let slot = Arc::new(Slot {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            filter,
            queue: Mutex::new(VecDeque::new()),
            capacity: self.inner.capacity,
            notify: Notify::new(),
            ended: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        {
            let mut slots = self.inner.slots.write();
            // Re-check under the lock so close() cannot miss this slot.
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(EngineError::DispatcherClosed);
            }
            slots.push(slot.clone());
        }
        debug!(subscriber = slot.id, filter = ?slot.filter, "Subscriber added");
        Ok(Subscription {
            slot,
            dispatcher: Arc::downgrade(&self.inner),
        })
    }

    pub fn publish_transaction(&self, tx: &Transaction, tracked: bool) {
        self.deliver(Event::Transaction(tx.clone()), tracked, tx.method.as_deref());
    }

    /// `method` is the method of the transaction that triggered the detection.
    pub fn publish_detection(&self, detection: &ThreatDetection, method: Option<&str>) {
        self.deliver(Event::ThreatDetection(detection.clone()), true, method);
    }

    pub fn publish_stats(&self, snapshot: &StatsSnapshot) {
        self.deliver(Event::Stats(snapshot.clone()), true, None);
    }

    fn deliver(&self, event: Event, tracked: bool, method: Option<&str>) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let slots = self.inner.slots.read();
        for slot in slots.iter() {
            if !slot.filter.accepts(&event, tracked, method) {
                continue;
            }
            if let Err(e) = slot.offer(event.clone()) {
                let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if slot.dropped.load(Ordering::Relaxed) == 1 {
                    warn!("{e}, dropping oldest events");
                } else {
                    debug!(total_dropped = total, "{e}");
                }
            }
        }
    }

    /// Stop accepting subscribers. Existing subscriptions end once drained.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let slots = std::mem::take(&mut *self.inner.slots.write());
        for slot in &slots {
            slot.end();
        }
        info!(subscribers = slots.len(), "Dispatcher closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Events dropped across all subscribers since start.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.slots.read().len()
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    slot: Arc<Slot>,
    dispatcher: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Next event, or `None` once the dispatcher is closed and the queue drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.slot.queue.lock().pop_front() {
                return Some(event);
            }
            if self.slot.ended.load(Ordering::Acquire) {
                return self.slot.queue.lock().pop_front();
            }
            self.slot.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.slot.queue.lock().pop_front()
    }

    /// Events this subscriber lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.slot.filter
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.ended.store(true, Ordering::Release);
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.slots.write().retain(|s| s.id != self.slot.id);
        }
        debug!(subscriber = self.slot.id, "Subscriber removed");
    }
}
