//! Suspension state persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One suspended run, as handed to the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionRecord {
    /// The suspended run's root execution id.
    pub run_id: String,
    /// The workflow the run belongs to.
    pub flow_id: String,
    /// Token a later `resume` must present.
    pub resume_token: String,
    /// Where in the graph the run stopped (the suspended step's id).
    pub graph_cursor: String,
    /// The execution context data at suspension time.
    pub context_snapshot: Map<String, Value>,
    /// When the suspension was recorded.
    pub created_at: DateTime<Utc>,
    /// When the suspension stops being resumable.
    pub expires_at: DateTime<Utc>,
}

impl SuspensionRecord {
    /// Whether the record has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

/// Error raised by a state store backend.
#[derive(Debug, thiserror::Error)]
#[error("state store error: {0}")]
pub struct StoreError(pub String);

/// Pluggable persistence for suspension records.
///
/// Durable implementations live outside the core; the engine only needs
/// save / load / remove keyed by run id.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a record, replacing any previous one for the run.
    async fn save(&self, record: SuspensionRecord) -> Result<(), StoreError>;

    /// Load the record for a run, if any.
    async fn load(&self, run_id: &str) -> Result<Option<SuspensionRecord>, StoreError>;

    /// Drop the record for a run.
    async fn remove(&self, run_id: &str) -> Result<(), StoreError>;
}

/// Process-local state store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: DashMap<String, SuspensionRecord>,
}

impl InMemoryStateStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, record: SuspensionRecord) -> Result<(), StoreError> {
        self.records.insert(record.run_id.clone(), record);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<SuspensionRecord>, StoreError> {
        Ok(self.records.get(run_id).map(|r| r.clone()))
    }

    async fn remove(&self, run_id: &str) -> Result<(), StoreError> {
        self.records.remove(run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(run_id: &str) -> SuspensionRecord {
        SuspensionRecord {
            run_id: run_id.into(),
            flow_id: "wf".into(),
            resume_token: "R".into(),
            graph_cursor: "wait-step".into(),
            context_snapshot: Map::new(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn save_load_remove() {
        let store = InMemoryStateStore::new();
        store.save(record("r1")).await.unwrap();
        assert_eq!(store.len(), 1);

        let loaded = store.load("r1").await.unwrap().unwrap();
        assert_eq!(loaded.resume_token, "R");
        assert!(store.load("r2").await.unwrap().is_none());

        store.remove("r1").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn save_replaces_previous_record() {
        let store = InMemoryStateStore::new();
        store.save(record("r1")).await.unwrap();
        let mut updated = record("r1");
        updated.resume_token = "R2".into();
        store.save(updated).await.unwrap();

        let loaded = store.load("r1").await.unwrap().unwrap();
        assert_eq!(loaded.resume_token, "R2");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn expiry() {
        let mut r = record("r1");
        assert!(!r.is_expired());
        r.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(r.is_expired());
    }

    #[test]
    fn record_serde_roundtrip() {
        let r = record("r1");
        let json = serde_json::to_string(&r).unwrap();
        let back: SuspensionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
