//! SQLite-backed state store

use super::DbPool;
use crate::domain::errors::StoreError;
use crate::domain::repositories::state_store::{split_path, RecordChange, StateStore, StoreResult};
use crate::infrastructure::memory_store::WatchRegistry;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use tokio::sync::mpsc;
use tracing::{debug, error};

pub struct SqliteStateStore {
    pool: DbPool,
    watchers: WatchRegistry,
}

impl SqliteStateStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            watchers: WatchRegistry::new(),
        }
    }
}

fn backend_error(action: &str, path: &str, e: sqlx::Error) -> StoreError {
    error!("Failed to {} {}: {}", action, path, e);
    StoreError::Backend(format!("{} {}: {}", action, path, e))
}

fn decode(path: &str, raw: &str) -> StoreResult<Value> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn read(&self, path: &str) -> StoreResult<Option<Value>> {
        split_path(path)?;
        let row = sqlx::query("SELECT value FROM records WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend_error("read", path, e))?;

        match row {
            Some(row) => {
                let raw: String = row
                    .try_get("value")
                    .map_err(|e| backend_error("decode", path, e))?;
                decode(path, &raw).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn write(&self, path: &str, value: Value) -> StoreResult<()> {
        let (collection, id) = split_path(path)?;
        let raw = serde_json::to_string(&value).map_err(|e| StoreError::Serialization {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO records (path, collection, record_id, value, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(path) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(path)
        .bind(collection)
        .bind(id)
        .bind(&raw)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| backend_error("write", path, e))?;

        debug!("Wrote {}", path);
        self.watchers.notify(collection, id, &value);
        Ok(())
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<(String, Value)>> {
        if collection.is_empty() {
            return Err(StoreError::InvalidPath(collection.to_string()));
        }
        let rows = sqlx::query(
            "SELECT record_id, value FROM records WHERE collection = ?1 ORDER BY record_id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend_error("list", collection, e))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("record_id")
                    .map_err(|e| backend_error("decode", collection, e))?;
                let raw: String = row
                    .try_get("value")
                    .map_err(|e| backend_error("decode", collection, e))?;
                let value = decode(&format!("{}/{}", collection, id), &raw)?;
                Ok((id, value))
            })
            .collect()
    }

    async fn watch(&self, collection: &str) -> StoreResult<mpsc::Receiver<RecordChange>> {
        Ok(self.watchers.subscribe(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::payment::{PaymentRecord, PaymentStatus, SweepKey};
    use crate::domain::repositories::state_store::{paths, StateStoreExt};
    use crate::persistence::init_database;
    use serde_json::json;

    async fn store() -> SqliteStateStore {
        SqliteStateStore::new(init_database("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn test_write_replaces_whole_value() {
        let store = store().await;
        store.write("tenants/a", json!({"x": 1, "y": 2})).await.unwrap();
        store.write("tenants/a", json!({"x": 3})).await.unwrap();

        assert_eq!(store.read("tenants/a").await.unwrap(), Some(json!({"x": 3})));
        assert_eq!(store.read("tenants/b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_direct_children() {
        let store = store().await;
        store.write(&paths::trade("t1", "b"), json!(2)).await.unwrap();
        store.write(&paths::trade("t1", "a"), json!(1)).await.unwrap();
        store.write(&paths::trade("t2", "c"), json!(3)).await.unwrap();

        let listed = store.list(&paths::trades("t1")).await.unwrap();
        assert_eq!(
            listed,
            vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
        );
        assert!(store.list("trades").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_receives_writes() {
        let store = store().await;
        let mut changes = store.watch(paths::TENANTS).await.unwrap();

        store.write(&paths::tenant("t1"), json!({"botSettings": {"isActive": true}})).await.unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.id, "t1");
        assert_eq!(change.value["botSettings"]["isActive"], json!(true));
    }

    #[tokio::test]
    async fn test_payment_record_survives_storage() {
        let store = store().await;
        let record = PaymentRecord::pending(
            "payment_1",
            "t1",
            "TDeposit",
            20_000_000,
            Utc::now(),
            SweepKey::new("deposit-secret"),
        );
        store.write_as(&paths::payment("t1"), &record).await.unwrap();

        let loaded: PaymentRecord = store.read_as(&paths::payment("t1")).await.unwrap().unwrap();
        assert_eq!(loaded.status(), PaymentStatus::Pending);
        assert!(loaded.has_sweep_key());
    }
}
