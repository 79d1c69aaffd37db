//! Row storage seen through the narrow interface the lookup terms need.

pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::metadata::NamespaceId;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("row is missing primary key `{0}`")]
    MissingPrimaryKey(String),
}

/// Lazily produced rows.
pub type RowStream = BoxStream<'static, Result<Value, StorageError>>;

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Row whose primary key equals `key`, if any.
    async fn get_row(
        &self,
        table: NamespaceId,
        primary_key: &str,
        key: &Value,
    ) -> Result<Option<Value>, StorageError>;

    /// Rows whose `index` field equals `key`.
    async fn index_lookup(
        &self,
        table: NamespaceId,
        index: &str,
        key: &Value,
    ) -> Result<RowStream, StorageError>;

    /// Make buffered writes for `table` durable. `false` reports a failed flush.
    async fn sync(&self, table: NamespaceId) -> Result<bool, StorageError>;
}
