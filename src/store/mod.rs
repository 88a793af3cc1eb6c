//! Document Store Driver Abstraction
//!
//! This module provides an abstraction over the document database the engine
//! runs on, allowing the system to use different drivers (in-process memory,
//! SQLite files, ...) without affecting the dispatcher or the object store.

pub mod config;
pub mod document;
pub mod memory_store;
pub mod sqlite_store;

#[cfg(test)]
mod comprehensive_test;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::error::StoreError;
use document::{Document, FindOptions, Update};

pub use config::{ConnectionOptions, Connector, StoreBackend, UriConnector};

/// Databases the store keeps for itself
pub const SYSTEM_DATABASES: [&str; 3] = ["admin", "local", "config"];

/// Page granularity used for storage-size estimates
const PAGE_SIZE: u64 = 4096;

/// Outcome of `update_one`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub acknowledged: bool,
    pub matched_count: u64,
    pub modified_count: u64,
}

/// Outcome of `delete_one` / `delete_many`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub acknowledged: bool,
    pub deleted_count: u64,
}

/// Size figures for one collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionStats {
    pub size: u64,
    pub storage_size: u64,
    pub count: u64,
    pub avg_obj_size: u64,
    pub nindexes: u64,
    pub total_index_size: u64,
}

/// Size figures for one database
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseStats {
    pub collections: u64,
    pub objects: u64,
    pub data_size: u64,
    pub storage_size: u64,
    pub indexes: u64,
    pub index_size: u64,
    pub avg_obj_size: u64,
    pub free_storage_size: u64,
    pub scale_factor: u64,
}

impl CollectionStats {
    /// Estimate stats from the documents and index keys of a collection
    pub fn estimate(docs: &[Document], index_keys: &[Vec<(String, i32)>]) -> Self {
        let size: u64 = docs.iter().map(serialized_len).sum();
        let count = docs.len() as u64;

        // The implicit _id index plus every created one
        let mut total_index_size: u64 = docs
            .iter()
            .map(|doc| doc.get(document::ID_FIELD).map(value_len).unwrap_or(0))
            .sum();
        for keys in index_keys {
            for doc in docs {
                for (field, _) in keys {
                    total_index_size += document::get_path(doc, field).map(value_len).unwrap_or(1);
                }
            }
        }

        Self {
            size,
            storage_size: size.div_ceil(PAGE_SIZE) * PAGE_SIZE,
            count,
            avg_obj_size: if count == 0 { 0 } else { size / count },
            nindexes: 1 + index_keys.len() as u64,
            total_index_size,
        }
    }
}

impl DatabaseStats {
    /// Roll collection figures up to database level
    pub fn aggregate<'a>(collections: impl IntoIterator<Item = &'a CollectionStats>, free_storage_size: u64) -> Self {
        let mut stats = DatabaseStats {
            scale_factor: 1,
            free_storage_size,
            ..Default::default()
        };
        for coll in collections {
            stats.collections += 1;
            stats.objects += coll.count;
            stats.data_size += coll.size;
            stats.storage_size += coll.storage_size;
            stats.indexes += coll.nindexes;
            stats.index_size += coll.total_index_size;
        }
        stats.avg_obj_size = if stats.objects == 0 { 0 } else { stats.data_size / stats.objects };
        stats
    }
}

fn serialized_len(doc: &Document) -> u64 {
    serde_json::to_vec(doc).map(|bytes| bytes.len() as u64).unwrap_or(0)
}

fn value_len(value: &Value) -> u64 {
    serde_json::to_vec(value).map(|bytes| bytes.len() as u64).unwrap_or(0)
}

/// Handle on one collection of one database
#[async_trait]
pub trait Collection: Send + Sync {
    /// Database this handle points into
    fn database_name(&self) -> &str;

    fn collection_name(&self) -> &str;

    /// Insert a document and return its identifier
    async fn insert_one(&self, doc: Document) -> Result<String, StoreError>;

    /// Insert documents in the given order and return their identifiers
    async fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<String>, StoreError>;

    async fn find(&self, filter: &Document, options: FindOptions) -> Result<Vec<Document>, StoreError>;

    /// First document in natural order matching the filter
    async fn find_one(&self, filter: &Document) -> Result<Option<Document>, StoreError>;

    /// Apply an update to the first matching document
    async fn update_one(&self, filter: &Document, update: &Update) -> Result<UpdateResult, StoreError>;

    async fn delete_one(&self, filter: &Document) -> Result<DeleteResult, StoreError>;

    async fn delete_many(&self, filter: &Document) -> Result<DeleteResult, StoreError>;

    async fn count_documents(&self, filter: &Document, limit: Option<u64>) -> Result<u64, StoreError>;

    /// Create an index if missing and return its name
    async fn create_index(&self, keys: &[(String, i32)]) -> Result<String, StoreError>;
}

/// A live connection to a document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Lightweight liveness check
    async fn ping(&self) -> Result<(), StoreError>;

    async fn list_databases(&self) -> Result<Vec<String>, StoreError>;

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError>;

    /// Build a collection handle; no I/O happens here
    fn collection(&self, database: &str, collection: &str) -> Arc<dyn Collection>;

    async fn database_stats(&self, database: &str) -> Result<DatabaseStats, StoreError>;

    async fn collection_stats(&self, database: &str, collection: &str) -> Result<CollectionStats, StoreError>;

    /// Release the connection
    async fn close(&self) -> Result<(), StoreError>;
}

/// Identifier for documents inserted without one
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Take the document's `_id` (stringifying non-string ids) or assign a fresh one
pub fn ensure_id(doc: &mut Document) -> String {
    let id = match doc.get(document::ID_FIELD) {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Null) | None => generate_id(),
        Some(other) => other.to_string(),
    };
    doc.insert(document::ID_FIELD.to_string(), Value::String(id.clone()));
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ensure_id_assigns_and_keeps() {
        let mut doc = Document::new();
        let id = ensure_id(&mut doc);
        assert_eq!(id.len(), 32);
        assert_eq!(doc.get("_id"), Some(&json!(id)));

        let mut doc = json!({"_id": "given"}).as_object().unwrap().clone();
        assert_eq!(ensure_id(&mut doc), "given");

        let mut doc = json!({"_id": 42}).as_object().unwrap().clone();
        assert_eq!(ensure_id(&mut doc), "42");
        assert_eq!(doc.get("_id"), Some(&json!("42")));
    }

    #[test]
    fn test_collection_stats_estimate() {
        let docs: Vec<Document> = (0..3)
            .map(|i| json!({"_id": format!("id{}", i), "n": i}).as_object().unwrap().clone())
            .collect();
        let stats = CollectionStats::estimate(&docs, &[vec![("n".to_string(), 1)]]);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.nindexes, 2);
        assert!(stats.size > 0);
        assert_eq!(stats.avg_obj_size, stats.size / 3);
        assert_eq!(stats.storage_size, PAGE_SIZE);
        assert!(stats.total_index_size > 0);

        let empty = CollectionStats::estimate(&[], &[]);
        assert_eq!(empty.avg_obj_size, 0);
        assert_eq!(empty.nindexes, 1);
        assert_eq!(empty.storage_size, 0);
    }

    #[test]
    fn test_database_stats_aggregate() {
        let a = CollectionStats { size: 100, storage_size: 4096, count: 4, avg_obj_size: 25, nindexes: 2, total_index_size: 10 };
        let b = CollectionStats { size: 50, storage_size: 4096, count: 1, avg_obj_size: 50, nindexes: 1, total_index_size: 5 };
        let stats = DatabaseStats::aggregate([&a, &b], 7);
        assert_eq!(stats.collections, 2);
        assert_eq!(stats.objects, 5);
        assert_eq!(stats.data_size, 150);
        assert_eq!(stats.storage_size, 8192);
        assert_eq!(stats.indexes, 3);
        assert_eq!(stats.index_size, 15);
        assert_eq!(stats.avg_obj_size, 30);
        assert_eq!(stats.free_storage_size, 7);
        assert_eq!(stats.scale_factor, 1);
    }
}
