//! In-memory state store and the watcher registry shared by every store backend

use crate::domain::errors::StoreError;
use crate::domain::repositories::state_store::{split_path, RecordChange, StateStore, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

const WATCH_BUFFER: usize = 1024;

/// Per-collection change subscribers.
///
/// Notification never blocks the writer: a watcher whose buffer is full misses
/// the change, and closed watchers are pruned on the next notification.
#[derive(Default)]
pub struct WatchRegistry {
    watchers: Mutex<HashMap<String, Vec<mpsc::Sender<RecordChange>>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, collection: &str) -> mpsc::Receiver<RecordChange> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(collection.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn notify(&self, collection: &str, id: &str, value: &Value) {
        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(senders) = watchers.get_mut(collection) else {
            return;
        };

        senders.retain(|tx| {
            let change = RecordChange {
                collection: collection.to_string(),
                id: id.to_string(),
                value: value.clone(),
            };
            match tx.try_send(change) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Watcher on {} is lagging; dropped change for {}", collection, id);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        if senders.is_empty() {
            watchers.remove(collection);
        }
    }

    pub fn watcher_count(&self, collection: &str) -> usize {
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(collection)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// Store backed by a sorted map of path to JSON value.
#[derive(Default)]
pub struct InMemoryStateStore {
    records: RwLock<BTreeMap<String, Value>>,
    watchers: WatchRegistry,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn read(&self, path: &str) -> StoreResult<Option<Value>> {
        split_path(path)?;
        Ok(self.records.read().await.get(path).cloned())
    }

    async fn write(&self, path: &str, value: Value) -> StoreResult<()> {
        let (collection, id) = split_path(path)?;
        self.records
            .write()
            .await
            .insert(path.to_string(), value.clone());
        self.watchers.notify(collection, id, &value);
        Ok(())
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<(String, Value)>> {
        if collection.is_empty() {
            return Err(StoreError::InvalidPath(collection.to_string()));
        }
        let prefix = format!("{}/", collection);
        let records = self.records.read().await;
        Ok(records
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, value)| {
                let id = &path[prefix.len()..];
                (!id.contains('/')).then(|| (id.to_string(), value.clone()))
            })
            .collect())
    }

    async fn watch(&self, collection: &str) -> StoreResult<mpsc::Receiver<RecordChange>> {
        Ok(self.watchers.subscribe(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_then_read() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.read("tenants/a").await.unwrap(), None);

        store.write("tenants/a", json!({"x": 1})).await.unwrap();
        store.write("tenants/a", json!({"x": 2})).await.unwrap();
        assert_eq!(store.read("tenants/a").await.unwrap(), Some(json!({"x": 2})));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_returns_direct_children_in_id_order() {
        let store = InMemoryStateStore::new();
        store.write("trades/t1/b", json!(2)).await.unwrap();
        store.write("trades/t1/a", json!(1)).await.unwrap();
        store.write("trades/t10/z", json!(9)).await.unwrap();
        store.write("trades/t1x", json!(0)).await.unwrap();

        let listed = store.list("trades/t1").await.unwrap();
        assert_eq!(
            listed,
            vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
        );

        let top = store.list("trades").await.unwrap();
        assert_eq!(top, vec![("t1x".to_string(), json!(0))]);
    }

    #[tokio::test]
    async fn test_invalid_paths_rejected() {
        let store = InMemoryStateStore::new();
        assert!(store.write("tenants", json!(1)).await.is_err());
        assert!(store.write("tenants/", json!(1)).await.is_err());
        assert!(store.read("/a").await.is_err());
    }

    #[tokio::test]
    async fn test_watch_sees_later_writes_in_its_collection_only() {
        let store = InMemoryStateStore::new();
        store.write("tenants/before", json!(0)).await.unwrap();

        let mut changes = store.watch("tenants").await.unwrap();
        store.write("payments/a", json!(1)).await.unwrap();
        store.write("tenants/a", json!({"on": true})).await.unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.collection, "tenants");
        assert_eq!(change.id, "a");
        assert_eq!(change.value, json!({"on": true}));
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_watchers_are_pruned() {
        let registry = WatchRegistry::new();
        let rx = registry.subscribe("tenants");
        let _kept = registry.subscribe("tenants");
        assert_eq!(registry.watcher_count("tenants"), 2);

        drop(rx);
        registry.notify("tenants", "a", &json!(1));
        assert_eq!(registry.watcher_count("tenants"), 1);
    }
}
