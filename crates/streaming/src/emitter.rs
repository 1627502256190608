//! Per-execution event emitter and subscriber queues.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use archflow_core::ExecutionId;
use archflow_event::ArchflowEvent;

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<ArchflowEvent>,
    closed: bool,
}

/// Bounded single-producer/single-consumer event queue.
#[derive(Debug)]
struct SubscriberQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

enum PushOutcome {
    Delivered,
    Overflowed,
    Closed,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Push an event; on overflow the queue is cleared, `overflow_event` is
    /// left as the only pending event, and the queue closes.
    fn push(&self, event: ArchflowEvent, overflow_event: impl FnOnce() -> ArchflowEvent) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                PushOutcome::Closed
            } else if state.events.len() >= self.capacity {
                state.events.clear();
                state.events.push_back(overflow_event());
                state.closed = true;
                PushOutcome::Overflowed
            } else {
                state.events.push_back(event);
                PushOutcome::Delivered
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Close the queue; pending events stay drainable.
    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

/// A subscriber's receiving half.
///
/// Events arrive in publish order. `None` means the subscriber was detached
/// (emitter completed, overflow, or unsubscribe) and the queue is drained.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: String,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// The subscriber id this subscription was registered under.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the next event.
    pub async fn recv(&self) -> Option<ArchflowEvent> {
        loop {
            {
                let mut state = self.queue.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Take the next event without waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<ArchflowEvent> {
        self.queue.state.lock().events.pop_front()
    }

    /// Returns `true` once the queue is closed and drained.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let state = self.queue.state.lock();
        state.closed && state.events.is_empty()
    }
}

/// Publisher for one execution id.
///
/// Assigns the per-execution event sequence (1, 2, 3, … with no gaps) and
/// fans each event out to every subscriber. Once completed, further
/// publishes are dropped.
pub struct EventStreamEmitter {
    execution_id: ExecutionId,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    completed: AtomicBool,
    sequence: AtomicU64,
    max_queue_size: usize,
    subscribers: DashMap<String, Arc<SubscriberQueue>>,
    /// Free-form attributes attached by publishers.
    pub attributes: DashMap<String, Value>,
    // Serializes sequence assignment with fan-out so every subscriber sees
    // sequences in increasing order.
    publish_lock: Mutex<()>,
}

impl EventStreamEmitter {
    /// Create an emitter for one execution id.
    #[must_use]
    pub fn new(execution_id: ExecutionId, max_queue_size: usize) -> Self {
        let now = Instant::now();
        Self {
            execution_id,
            created_at: now,
            last_activity: Mutex::new(now),
            completed: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            max_queue_size,
            subscribers: DashMap::new(),
            attributes: DashMap::new(),
            publish_lock: Mutex::new(()),
        }
    }

    /// The execution this emitter publishes for.
    #[must_use]
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// When the emitter was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the last publish or subscribe.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Returns `true` once the emitter has gone terminal.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Attach a subscriber under `id`, replacing any previous subscription
    /// with that id.
    pub fn subscribe(&self, id: impl Into<String>) -> Subscription {
        let id = id.into();
        let queue = Arc::new(SubscriberQueue::new(self.max_queue_size));
        if let Some(old) = self.subscribers.insert(id.clone(), Arc::clone(&queue)) {
            old.close();
        }
        self.touch();
        Subscription { id, queue }
    }

    /// Detach a subscriber; its pending events stay drainable.
    pub fn unsubscribe(&self, id: &str) {
        if let Some((_, queue)) = self.subscribers.remove(id) {
            queue.close();
        }
    }

    /// Publish an event to every subscriber.
    ///
    /// Assigns the event's sequence number. Returns how many subscribers the
    /// event reached; publishes after completion are dropped and return 0.
    pub fn publish(&self, mut event: ArchflowEvent) -> usize {
        if self.is_completed() {
            tracing::debug!(execution_id = %self.execution_id, "dropping publish on completed emitter");
            return 0;
        }
        let _guard = self.publish_lock.lock();
        if self.is_completed() {
            return 0;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        event.sequence = sequence;
        self.touch();
        self.fan_out(event)
    }

    fn fan_out(&self, event: ArchflowEvent) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();
        for entry in &self.subscribers {
            let outcome = entry.value().push(event.clone(), || {
                let mut overflow = ArchflowEvent::system_error(
                    &self.execution_id,
                    "subscriber queue overflow; subscriber dropped",
                );
                overflow.sequence = event.sequence;
                overflow
            });
            match outcome {
                PushOutcome::Delivered => delivered += 1,
                PushOutcome::Overflowed => overflowed.push(entry.key().clone()),
                PushOutcome::Closed => {}
            }
        }
        for id in overflowed {
            tracing::warn!(execution_id = %self.execution_id, subscriber = %id, "subscriber overflowed; detaching");
            self.subscribers.remove(&id);
        }
        delivered
    }

    /// Mark the emitter terminal: publish a final END event, then detach all
    /// subscribers (they drain what is queued, then see end-of-stream).
    pub fn complete(&self) {
        let _guard = self.publish_lock.lock();
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let mut end = ArchflowEvent::system_end(&self.execution_id);
        end.sequence = sequence;
        self.touch();
        self.fan_out(end);
        for entry in &self.subscribers {
            entry.value().close();
        }
        self.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archflow_core::ExecutionKind;
    use archflow_event::EventType;

    fn emitter(max_queue: usize) -> EventStreamEmitter {
        EventStreamEmitter::new(ExecutionId::new_root(ExecutionKind::Flow), max_queue)
    }

    #[test]
    fn sequences_start_at_one_with_no_gaps() {
        let emitter = emitter(16);
        let sub = emitter.subscribe("s1");
        for i in 0..5 {
            emitter.publish(ArchflowEvent::chat_delta(
                emitter.execution_id(),
                &format!("c{i}"),
                None,
            ));
        }
        let sequences: Vec<u64> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn publish_reports_reached_subscribers() {
        let emitter = emitter(16);
        assert_eq!(
            emitter.publish(ArchflowEvent::chat_start(emitter.execution_id())),
            0
        );
        let _a = emitter.subscribe("a");
        let _b = emitter.subscribe("b");
        assert_eq!(
            emitter.publish(ArchflowEvent::chat_start(emitter.execution_id())),
            2
        );
    }

    #[test]
    fn every_subscriber_gets_a_copy() {
        let emitter = emitter(16);
        let a = emitter.subscribe("a");
        let b = emitter.subscribe("b");
        emitter.publish(ArchflowEvent::chat_delta(emitter.execution_id(), "x", None));
        assert!(a.try_recv().is_some());
        assert!(b.try_recv().is_some());
    }

    #[test]
    fn overflow_drops_queue_and_detaches_subscriber() {
        let emitter = emitter(2);
        let slow = emitter.subscribe("slow");

        for i in 0..3 {
            emitter.publish(ArchflowEvent::chat_delta(
                emitter.execution_id(),
                &format!("{i}"),
                None,
            ));
        }

        // The queued events were dropped; only the overflow error remains.
        let only = slow.try_recv().unwrap();
        assert_eq!(only.event_type, EventType::Error);
        assert!(slow.try_recv().is_none());
        assert!(slow.is_finished());
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[test]
    fn overflowed_subscriber_does_not_stall_others() {
        let emitter = emitter(1);
        let _slow = emitter.subscribe("slow");
        let fast = emitter.subscribe("fast");

        emitter.publish(ArchflowEvent::chat_delta(emitter.execution_id(), "1", None));
        assert!(fast.try_recv().is_some());
        emitter.publish(ArchflowEvent::chat_delta(emitter.execution_id(), "2", None));
        assert!(fast.try_recv().is_some());
    }

    #[tokio::test]
    async fn complete_delivers_end_then_detaches() {
        let emitter = emitter(16);
        let sub = emitter.subscribe("s");
        emitter.publish(ArchflowEvent::chat_delta(emitter.execution_id(), "x", None));
        emitter.complete();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::Delta);
        let end = sub.recv().await.unwrap();
        assert_eq!(end.event_type, EventType::End);
        assert_eq!(end.sequence, 2);
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn publishes_after_completion_are_dropped() {
        let emitter = emitter(16);
        emitter.complete();
        assert!(emitter.is_completed());
        assert_eq!(
            emitter.publish(ArchflowEvent::chat_start(emitter.execution_id())),
            0
        );
    }

    #[test]
    fn complete_is_idempotent() {
        let emitter = emitter(16);
        let sub = emitter.subscribe("s");
        emitter.complete();
        emitter.complete();
        assert!(sub.try_recv().is_some()); // single END
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let emitter = Arc::new(emitter(16));
        let sub = emitter.subscribe("s");

        let publisher = {
            let emitter = Arc::clone(&emitter);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                emitter.publish(ArchflowEvent::chat_delta(emitter.execution_id(), "hi", None));
            })
        };

        let event = sub.recv().await.unwrap();
        assert_eq!(event.sequence, 1);
        publisher.await.unwrap();
    }

    #[test]
    fn concurrent_publishers_keep_per_subscriber_order() {
        let emitter = Arc::new(emitter(10_000));
        let sub = emitter.subscribe("s");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let emitter = Arc::clone(&emitter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        emitter.publish(ArchflowEvent::chat_delta(
                            emitter.execution_id(),
                            "x",
                            None,
                        ));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let sequences: Vec<u64> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.sequence).collect();
        assert_eq!(sequences.len(), 400);
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }
}
