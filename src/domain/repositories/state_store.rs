//! State Store Trait
//!
//! Document-style store shared by every process: tenant configuration, session
//! status, trade history and payment records. Records are JSON values addressed
//! by slash-separated paths; a record's collection is everything before the last
//! slash. Writes replace the whole value.

use crate::domain::errors::StoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

pub type StoreResult<T> = Result<T, StoreError>;

/// Record layout
pub mod paths {
    pub const TENANTS: &str = "tenants";
    pub const SESSIONS: &str = "sessions";
    pub const PAYMENTS: &str = "payments";

    pub fn tenant(tenant_id: &str) -> String {
        format!("{}/{}", TENANTS, tenant_id)
    }

    pub fn session(tenant_id: &str) -> String {
        format!("{}/{}", SESSIONS, tenant_id)
    }

    pub fn trades(tenant_id: &str) -> String {
        format!("trades/{}", tenant_id)
    }

    pub fn trade(tenant_id: &str, trade_id: &str) -> String {
        format!("trades/{}/{}", tenant_id, trade_id)
    }

    pub fn payment(tenant_id: &str) -> String {
        format!("{}/{}", PAYMENTS, tenant_id)
    }
}

/// Split `a/b/c` into collection `a/b` and id `c`.
pub fn split_path(path: &str) -> StoreResult<(&str, &str)> {
    match path.rsplit_once('/') {
        Some((collection, id)) if !collection.is_empty() && !id.is_empty() => Ok((collection, id)),
        _ => Err(StoreError::InvalidPath(path.to_string())),
    }
}

/// A write observed on a watched collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    pub collection: String,
    pub id: String,
    pub value: Value,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, path: &str) -> StoreResult<Option<Value>>;

    /// Replace the record at `path`.
    async fn write(&self, path: &str, value: Value) -> StoreResult<()>;

    /// Direct children of `collection` as `(id, value)`, ordered by id.
    async fn list(&self, collection: &str) -> StoreResult<Vec<(String, Value)>>;

    /// Changes to direct children of `collection` made after this call.
    async fn watch(&self, collection: &str) -> StoreResult<mpsc::Receiver<RecordChange>>;
}

/// Typed helpers over any [`StateStore`].
#[async_trait]
pub trait StateStoreExt: StateStore {
    async fn read_as<T: DeserializeOwned + Send>(&self, path: &str) -> StoreResult<Option<T>> {
        match self.read(path).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::Serialization {
                    path: path.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn write_as<T: Serialize + Sync>(&self, path: &str, value: &T) -> StoreResult<()> {
        let value = serde_json::to_value(value).map_err(|e| StoreError::Serialization {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        self.write(path, value).await
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}
