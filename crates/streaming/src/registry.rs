//! Registry of per-execution emitters.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use archflow_core::ExecutionId;
use archflow_event::ArchflowEvent;

use crate::emitter::EventStreamEmitter;

/// Streaming configuration (`streaming.*` options).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Hard ceiling on live emitters; exceeding it evicts the
    /// least-recently-active one.
    pub max_emitters: usize,
    /// Bound of each subscriber's queue.
    pub max_queue_size: usize,
    /// Emitters idle longer than this are reaped.
    pub idle_timeout_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_emitters: 1000,
            max_queue_size: 100,
            idle_timeout_ms: 5_000,
        }
    }
}

/// Owns the execution-id → emitter mapping.
///
/// Emitters are created on first publish (or explicitly via
/// [`StreamingRegistry::emitter`]) and go away on completion, eviction or
/// idle reaping.
pub struct StreamingRegistry {
    config: StreamingConfig,
    emitters: DashMap<String, Arc<EventStreamEmitter>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl StreamingRegistry {
    /// Create a registry with the given configuration.
    #[must_use]
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            emitters: DashMap::new(),
            reaper: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of live emitters.
    #[must_use]
    pub fn emitter_count(&self) -> usize {
        self.emitters.len()
    }

    /// Get or create the emitter for an execution id.
    pub fn emitter(&self, execution_id: &ExecutionId) -> Arc<EventStreamEmitter> {
        let key = execution_id.to_string();
        if let Some(existing) = self.emitters.get(&key) {
            return Arc::clone(&existing);
        }
        // Creating may push us over the cap; evict before inserting.
        if self.emitters.len() >= self.config.max_emitters {
            self.evict_least_recently_active();
        }
        let created = Arc::new(EventStreamEmitter::new(
            execution_id.clone(),
            self.config.max_queue_size,
        ));
        self.emitters
            .entry(key)
            .or_insert_with(|| Arc::clone(&created))
            .clone()
    }

    /// Look up an emitter without creating one.
    #[must_use]
    pub fn get(&self, execution_id: &str) -> Option<Arc<EventStreamEmitter>> {
        self.emitters.get(execution_id).map(|e| Arc::clone(&e))
    }

    /// Publish an event to its execution's emitter, creating the emitter on
    /// first use. Returns the number of subscribers reached.
    pub fn publish(&self, execution_id: &ExecutionId, event: ArchflowEvent) -> usize {
        self.emitter(execution_id).publish(event)
    }

    /// Convenience: publish a `chat/delta` event.
    ///
    /// Unlike [`Self::publish`] this never creates an emitter; it returns 0
    /// when none exists.
    pub fn broadcast_delta(&self, execution_id: &str, content: &str) -> usize {
        match self.get(execution_id) {
            Some(emitter) => {
                let event = ArchflowEvent::chat_delta(emitter.execution_id(), content, None);
                emitter.publish(event)
            }
            None => 0,
        }
    }

    /// Mark an execution's emitter terminal and release its slot.
    pub fn complete(&self, execution_id: &str) {
        if let Some((_, emitter)) = self.emitters.remove(execution_id) {
            emitter.complete();
        }
    }

    fn evict_least_recently_active(&self) {
        let victim = self
            .emitters
            .iter()
            .max_by_key(|entry| entry.value().idle_for())
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            tracing::warn!(execution_id = %key, "emitter cap reached; evicting least-recently-active");
            self.complete(&key);
        }
    }

    /// Start the idle reaper task. Idempotent.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let mut slot = self.reaper.lock();
        if slot.is_some() {
            return;
        }
        let registry = Arc::clone(self);
        let cancel = self.shutdown.clone();
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let scan_every = (idle_timeout / 2).max(Duration::from_millis(100));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.reap_idle(idle_timeout),
                }
            }
        }));
    }

    fn reap_idle(&self, idle_timeout: Duration) {
        let idle: Vec<String> = self
            .emitters
            .iter()
            .filter(|entry| !entry.value().is_completed() && entry.value().idle_for() > idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for key in idle {
            tracing::debug!(execution_id = %key, "reaping idle emitter");
            self.complete(&key);
        }
    }

    /// Stop the reaper task.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.reaper.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archflow_core::ExecutionKind;
    use archflow_event::EventType;

    fn registry(config: StreamingConfig) -> StreamingRegistry {
        StreamingRegistry::new(config)
    }

    fn exec_id() -> ExecutionId {
        ExecutionId::new_root(ExecutionKind::Flow)
    }

    #[test]
    fn emitter_is_created_on_first_publish() {
        let registry = registry(StreamingConfig::default());
        let id = exec_id();
        assert_eq!(registry.emitter_count(), 0);
        registry.publish(&id, ArchflowEvent::chat_start(&id));
        assert_eq!(registry.emitter_count(), 1);
    }

    #[test]
    fn same_execution_reuses_the_emitter() {
        let registry = registry(StreamingConfig::default());
        let id = exec_id();
        let a = registry.emitter(&id);
        let b = registry.emitter(&id);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn broadcast_delta_without_emitter_reaches_nobody() {
        let registry = registry(StreamingConfig::default());
        assert_eq!(registry.broadcast_delta("FLOW_missing_000", "hi"), 0);
        assert_eq!(registry.emitter_count(), 0);
    }

    #[test]
    fn broadcast_delta_reaches_subscribers() {
        let registry = registry(StreamingConfig::default());
        let id = exec_id();
        let emitter = registry.emitter(&id);
        let sub = emitter.subscribe("s");

        assert_eq!(registry.broadcast_delta(&id.to_string(), "hello"), 1);
        let event = sub.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::Delta);
        assert_eq!(event.data["content"], "hello");
    }

    #[test]
    fn complete_releases_the_slot_and_ends_subscribers() {
        let registry = registry(StreamingConfig::default());
        let id = exec_id();
        let emitter = registry.emitter(&id);
        let sub = emitter.subscribe("s");

        registry.complete(&id.to_string());

        assert_eq!(registry.emitter_count(), 0);
        assert_eq!(sub.try_recv().unwrap().event_type, EventType::End);
        assert!(sub.is_finished());
    }

    #[test]
    fn cap_evicts_least_recently_active() {
        let registry = registry(StreamingConfig {
            max_emitters: 2,
            ..StreamingConfig::default()
        });
        let oldest = exec_id();
        let newer = exec_id();
        registry.emitter(&oldest);
        std::thread::sleep(Duration::from_millis(20));
        registry.emitter(&newer);
        std::thread::sleep(Duration::from_millis(5));
        // Touch `newer` so `oldest` is the least recently active.
        registry.publish(&newer, ArchflowEvent::chat_start(&newer));

        let third = exec_id();
        registry.emitter(&third);

        assert_eq!(registry.emitter_count(), 2);
        assert!(registry.get(&oldest.to_string()).is_none());
        assert!(registry.get(&newer.to_string()).is_some());
        assert!(registry.get(&third.to_string()).is_some());
    }

    #[tokio::test]
    async fn reaper_closes_idle_emitters() {
        // Idle detection uses wall-clock instants, so this test runs in
        // real time with a short timeout.
        let registry = Arc::new(registry(StreamingConfig {
            idle_timeout_ms: 100,
            ..StreamingConfig::default()
        }));
        let id = exec_id();
        let emitter = registry.emitter(&id);
        let sub = emitter.subscribe("s");
        registry.spawn_reaper();

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(registry.emitter_count(), 0);
        assert_eq!(sub.try_recv().unwrap().event_type, EventType::End);
        registry.shutdown().await;
    }
}
