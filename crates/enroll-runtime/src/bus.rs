//! Per-session event topics with replay and bounded fan-out.
//!
//! Each session has one [`Topic`]: a sequence counter, a ring of the most
//! recent events, and one drop-oldest queue per observer. Publishing never
//! awaits; it takes the topic lock, stamps the draft, and pushes the event
//! onto every queue. Observers resume after a reconnect by subscribing with
//! the last sequence number they saw.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use enroll_core::events::{Event, EventDraft};
use enroll_core::ids::SessionId;
use futures::Stream;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::errors::RuntimeError;

/// Boxed stream of session events.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// One observer's bounded queue.
#[derive(Debug)]
struct ObserverQueue {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl ObserverQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: Event) {
        {
            let mut events = self.events.lock();
            if events.len() >= self.capacity {
                let _ = events.pop_front();
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("event_observer_drops_total").increment(1);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct TopicState {
    next_seq: u64,
    ring: VecDeque<Event>,
    observers: Vec<Arc<ObserverQueue>>,
    closed: bool,
}

/// A single session's event topic.
struct Topic {
    state: Mutex<TopicState>,
}

/// Sequenced, replayable event fan-out keyed by session.
pub struct EventBus {
    topics: DashMap<SessionId, Arc<Topic>>,
    ring_capacity: usize,
    queue_capacity: usize,
}

impl EventBus {
    /// Create a bus with the given retention and per-observer queue sizes.
    pub fn new(ring_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            ring_capacity: ring_capacity.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Create the topic for a session. Opening an existing topic is a no-op.
    pub fn open(&self, session_id: &SessionId) {
        let _ = self.topics.entry(session_id.clone()).or_insert_with(|| {
            Arc::new(Topic {
                state: Mutex::new(TopicState {
                    next_seq: 1,
                    ring: VecDeque::with_capacity(self.ring_capacity.min(64)),
                    observers: Vec::new(),
                    closed: false,
                }),
            })
        });
    }

    /// Stamp and fan out a draft. Returns `None` when the topic is gone.
    pub fn publish(&self, session_id: &SessionId, draft: EventDraft) -> Option<Event> {
        let topic = self.topics.get(session_id).map(|t| Arc::clone(t.value()))?;
        let mut state = topic.state.lock();
        if state.closed {
            return None;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let event = Event::from_draft(session_id.clone(), seq, draft);

        if state.ring.len() >= self.ring_capacity {
            let _ = state.ring.pop_front();
        }
        state.ring.push_back(event.clone());

        state.observers.retain(|q| !q.is_closed());
        for queue in &state.observers {
            queue.push(event.clone());
        }
        trace!(session_id = %session_id, seq, kind = ?event.kind, observers = state.observers.len(), "event published");
        Some(event)
    }

    /// Subscribe to a session's events, replaying everything retained after
    /// `after_seq` before following live events.
    pub fn subscribe(
        &self,
        session_id: &SessionId,
        after_seq: u64,
    ) -> Result<Subscription, RuntimeError> {
        let topic = self
            .topics
            .get(session_id)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| RuntimeError::SessionNotFound(session_id.clone()))?;
        let mut state = topic.state.lock();
        if state.closed {
            return Err(RuntimeError::SessionNotFound(session_id.clone()));
        }

        let replay: VecDeque<Event> = state
            .ring
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect();
        let oldest = state.ring.front().map_or(state.next_seq, |e| e.seq);
        let truncated = after_seq + 1 < oldest;

        let queue = Arc::new(ObserverQueue::new(self.queue_capacity));
        state.observers.push(Arc::clone(&queue));
        debug!(session_id = %session_id, after_seq, replay = replay.len(), truncated, "observer subscribed");

        Ok(Subscription {
            replay,
            queue,
            after_seq,
            truncated,
        })
    }

    /// End every subscription for a session and remove its topic.
    pub fn close(&self, session_id: &SessionId) {
        let Some((_, topic)) = self.topics.remove(session_id) else {
            return;
        };
        let mut state = topic.state.lock();
        state.closed = true;
        for queue in state.observers.drain(..) {
            queue.close();
        }
        debug!(session_id = %session_id, "topic closed");
    }

    /// Sequence number of the most recent event, or 0 before the first.
    pub fn last_seq(&self, session_id: &SessionId) -> Option<u64> {
        let topic = self.topics.get(session_id)?;
        let seq = topic.state.lock().next_seq - 1;
        Some(seq)
    }

    /// Live observers on a session's topic.
    pub fn observer_count(&self, session_id: &SessionId) -> usize {
        self.topics.get(session_id).map_or(0, |topic| {
            topic
                .state
                .lock()
                .observers
                .iter()
                .filter(|q| !q.is_closed())
                .count()
        })
    }

    /// Number of open topics.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// A live subscription. Dropping it detaches the observer.
#[derive(Debug)]
pub struct Subscription {
    replay: VecDeque<Event>,
    queue: Arc<ObserverQueue>,
    after_seq: u64,
    truncated: bool,
}

impl Subscription {
    /// Next event, or `None` once the topic is closed and drained. Never
    /// yields an event at or below the resume point, even when the caller
    /// resumed from a sequence number the topic has not reached.
    pub async fn next(&mut self) -> Option<Event> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            let popped = self.queue.events.lock().pop_front();
            if let Some(event) = popped {
                if event.seq > self.after_seq {
                    return Some(event);
                }
                continue;
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Whether events between `after_seq` and the oldest retained event were
    /// already evicted when this subscription was made.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Events dropped from this observer's queue because it fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Convert into a boxed stream.
    pub fn into_stream(mut self) -> EventStream {
        Box::pin(async_stream::stream! {
            while let Some(event) = self.next().await {
                yield event;
            }
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
    }
}
