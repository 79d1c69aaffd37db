use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{RowStore, RowStream, StorageError};
use crate::metadata::NamespaceId;

/// In-memory row store keyed by table and encoded primary key.
#[derive(Default)]
pub struct MemStore {
    tables: RwLock<BTreeMap<NamespaceId, BTreeMap<String, Value>>>,
    /// Tables with writes not yet synced.
    dirty: RwLock<BTreeSet<NamespaceId>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `row`, keyed by its `primary_key` field.
    pub async fn insert(
        &self,
        table: NamespaceId,
        primary_key: &str,
        row: Value,
    ) -> Result<(), StorageError> {
        let key = row
            .get(primary_key)
            .ok_or_else(|| StorageError::MissingPrimaryKey(primary_key.to_string()))?;
        let encoded = serde_json::to_string(key)?;
        self.tables
            .write()
            .await
            .entry(table)
            .or_default()
            .insert(encoded, row);
        self.dirty.write().await.insert(table);
        Ok(())
    }

    /// Number of rows stored for `table`.
    pub async fn len(&self, table: NamespaceId) -> usize {
        self.tables
            .read()
            .await
            .get(&table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub async fn is_dirty(&self, table: NamespaceId) -> bool {
        self.dirty.read().await.contains(&table)
    }
}

#[async_trait]
impl RowStore for MemStore {
    async fn get_row(
        &self,
        table: NamespaceId,
        _primary_key: &str,
        key: &Value,
    ) -> Result<Option<Value>, StorageError> {
        let encoded = serde_json::to_string(key)?;
        Ok(self
            .tables
            .read()
            .await
            .get(&table)
            .and_then(|rows| rows.get(&encoded))
            .cloned())
    }

    async fn index_lookup(
        &self,
        table: NamespaceId,
        index: &str,
        key: &Value,
    ) -> Result<RowStream, StorageError> {
        let matches: Vec<Value> = self
            .tables
            .read()
            .await
            .get(&table)
            .map(|rows| {
                rows.values()
                    .filter(|row| row.get(index) == Some(key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(stream::iter(matches.into_iter().map(Ok)).boxed())
    }

    async fn sync(&self, table: NamespaceId) -> Result<bool, StorageError> {
        self.dirty.write().await.remove(&table);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn insert_get_and_index_lookup() {
        let store = MemStore::new();
        let t = Uuid::new_v4();
        store.insert(t, "id", json!({"id": 1, "color": "red"})).await.unwrap();
        store.insert(t, "id", json!({"id": 2, "color": "red"})).await.unwrap();
        store.insert(t, "id", json!({"id": 3, "color": "blue"})).await.unwrap();

        assert_eq!(
            store.get_row(t, "id", &json!(2)).await.unwrap(),
            Some(json!({"id": 2, "color": "red"}))
        );
        assert_eq!(store.get_row(t, "id", &json!(9)).await.unwrap(), None);
        // Keys compare by JSON value, so the string "1" is a different key.
        assert_eq!(store.get_row(t, "id", &json!("1")).await.unwrap(), None);

        let reds: Vec<Value> = store
            .index_lookup(t, "color", &json!("red"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(reds.len(), 2);
        assert_eq!(store.len(t).await, 3);
    }

    #[tokio::test]
    async fn insert_requires_primary_key_and_sync_clears_dirty() {
        let store = MemStore::new();
        let t = Uuid::new_v4();
        let err = store.insert(t, "pk", json!({"id": 1})).await.unwrap_err();
        assert!(matches!(err, StorageError::MissingPrimaryKey(ref k) if k == "pk"));

        store.insert(t, "pk", json!({"pk": "a"})).await.unwrap();
        assert!(store.is_dirty(t).await);
        assert!(store.sync(t).await.unwrap());
        assert!(!store.is_dirty(t).await);
    }
}
