//! Chunked Object Store
//!
//! Large binary payloads are stored as one metadata document in the caller's
//! collection plus fixed-size chunk documents in a shared chunk collection of
//! the same database. Metadata is written before any chunk so a reader never
//! sees chunks without an owner, and reads verify the reassembled payload
//! (chunk sequence, total size, checksum) before returning it.

pub mod codec;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::ConnectionManager;
use crate::error::{DbError, DbResult, StoreError};
use crate::store::document::{timestamp_value, Document, FindOptions, SortOrder};
use crate::store::{generate_id, Collection};

pub const CHUNK_SIZE: usize = 100 * 1024;
pub const CHUNK_BATCH_SIZE: usize = 50;
pub const CHUNK_COLLECTION: &str = "video_chunks";

/// Chunk store layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSettings {
    pub chunk_size: usize,
    pub batch_size: usize,
    pub chunk_collection: String,
}

impl Default for ObjectSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            batch_size: CHUNK_BATCH_SIZE,
            chunk_collection: CHUNK_COLLECTION.to_string(),
        }
    }
}

/// Discriminator separating metadata from chunk documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Metadata,
    Chunk,
}

/// Decoded create-object request
#[derive(Debug, Clone, PartialEq)]
pub struct NewObject {
    pub payload: Bytes,
    pub content_type: String,
    pub metadata: Document,
    pub is_private: bool,
}

impl NewObject {
    /// Build from `{ video, metadata: { filename, .. }, isPrivate? }`
    pub fn from_request(data: Value) -> DbResult<Self> {
        let Value::Object(mut data) = data else {
            return Err(DbError::MissingField("video".to_string()));
        };
        let encoded = match data.remove("video") {
            Some(Value::String(encoded)) if !encoded.is_empty() => encoded,
            Some(Value::String(_)) | Some(Value::Null) | None => return Err(DbError::MissingField("video".to_string())),
            Some(_) => return Err(DbError::InvalidPayload("'video' must be an encoded string".to_string())),
        };
        let (content_type, payload) = codec::decode_payload(&encoded)?;
        if payload.is_empty() {
            return Err(DbError::InvalidPayload("video payload is empty".to_string()));
        }
        let metadata = match data.remove("metadata") {
            Some(Value::Object(metadata)) => metadata,
            Some(Value::Null) | None => Document::new(),
            Some(_) => return Err(DbError::InvalidPayload("'metadata' must be an object".to_string())),
        };
        let is_private = match data.remove("isPrivate") {
            Some(Value::Bool(flag)) => flag,
            Some(Value::Null) | None => true,
            Some(_) => return Err(DbError::InvalidPayload("'isPrivate' must be a boolean".to_string())),
        };
        Ok(Self {
            payload,
            content_type,
            metadata,
            is_private,
        })
    }

    pub fn filename(&self) -> String {
        self.metadata
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or("untitled")
            .to_string()
    }
}

/// Stored once per object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub video_id: String,
    pub metadata: Document,
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub checksum: String,
    pub created_at: Value,
    #[serde(rename = "isPrivate")]
    pub is_private: bool,
    pub chunk_count: u64,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
}

/// One byte range of an object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDocument {
    pub video_id: String,
    pub chunk_index: u64,
    #[serde(with = "codec::base64_bytes")]
    pub data: Bytes,
    #[serde(rename = "type")]
    pub kind: DocumentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectReceipt {
    pub id: String,
    pub size: u64,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDeletion {
    pub acknowledged: bool,
    pub metadata_deleted: u64,
    pub chunks_deleted: u64,
}

/// Running totals of one logical delete. Retried attempts add to the same
/// tally, so work done by a failed attempt is still reported.
#[derive(Debug, Default)]
pub struct DeletionProgress {
    metadata: AtomicU64,
    chunks: AtomicU64,
}

impl DeletionProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> ObjectDeletion {
        ObjectDeletion {
            acknowledged: true,
            metadata_deleted: self.metadata.load(Ordering::SeqCst),
            chunks_deleted: self.chunks.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectContent {
    pub id: String,
    /// Data URI of the reassembled payload
    pub video: String,
    pub metadata: Document,
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub created_at: Value,
}

fn to_document<T: Serialize>(value: &T) -> DbResult<Document> {
    match serde_json::to_value(value).map_err(StoreError::from)? {
        Value::Object(doc) => Ok(doc),
        _ => Err(DbError::InvalidPayload("document must serialize to an object".to_string())),
    }
}

fn from_document<T: for<'de> Deserialize<'de>>(doc: Document) -> DbResult<T> {
    Ok(serde_json::from_value(Value::Object(doc)).map_err(StoreError::from)?)
}

fn object_filter(id: &str, kind: DocumentKind) -> DbResult<Document> {
    let mut filter = Document::new();
    filter.insert("video_id".to_string(), Value::String(id.to_string()));
    filter.insert("type".to_string(), serde_json::to_value(kind).map_err(StoreError::from)?);
    Ok(filter)
}

pub struct ObjectStore {
    connection: Arc<ConnectionManager>,
    settings: ObjectSettings,
}

impl ObjectStore {
    pub fn new(connection: Arc<ConnectionManager>, settings: ObjectSettings) -> Self {
        Self { connection, settings }
    }

    /// Shared chunk collection of `database`, indexed on first use
    async fn chunk_collection(&self, database: &str) -> DbResult<Arc<dyn Collection>> {
        let chunks = self
            .connection
            .get_collection(database, &self.settings.chunk_collection)
            .await?;
        let by_position = [("video_id".to_string(), 1), ("chunk_index".to_string(), 1)];
        self.connection.ensure_index(chunks.as_ref(), &by_position).await?;
        self.connection
            .ensure_index(chunks.as_ref(), &[("type".to_string(), 1)])
            .await?;
        Ok(chunks)
    }

    pub async fn create(&self, collection: &dyn Collection, object: &NewObject) -> DbResult<ObjectReceipt> {
        self.create_at(collection, object, Utc::now()).await
    }

    pub async fn create_at(
        &self,
        collection: &dyn Collection,
        object: &NewObject,
        now: DateTime<Utc>,
    ) -> DbResult<ObjectReceipt> {
        let chunks_collection = self.chunk_collection(collection.database_name()).await?;
        let video_id = generate_id();
        let chunks = codec::split_into_chunks(&object.payload, self.settings.chunk_size);
        let size = object.payload.len() as u64;
        let filename = object.filename();

        let metadata = ObjectMetadata {
            video_id: video_id.clone(),
            metadata: object.metadata.clone(),
            filename: filename.clone(),
            size,
            content_type: object.content_type.clone(),
            checksum: codec::checksum(&object.payload),
            created_at: timestamp_value(now),
            is_private: object.is_private,
            chunk_count: chunks.len() as u64,
            kind: DocumentKind::Metadata,
        };
        collection.insert_one(to_document(&metadata)?).await?;
        info!("Stored metadata for object {} ({} bytes, {} chunks)", video_id, size, chunks.len());

        // Batches go out one after another; the index field is authoritative for order
        let batch_size = self.settings.batch_size.max(1);
        for (batch_number, batch) in chunks.chunks(batch_size).enumerate() {
            let docs = batch
                .iter()
                .enumerate()
                .map(|(offset, data)| {
                    to_document(&ChunkDocument {
                        video_id: video_id.clone(),
                        chunk_index: (batch_number * batch_size + offset) as u64,
                        data: data.clone(),
                        kind: DocumentKind::Chunk,
                    })
                })
                .collect::<DbResult<Vec<_>>>()?;
            chunks_collection.insert_many(docs).await?;
            debug!("Wrote chunk batch {} of object {}", batch_number, video_id);
        }

        Ok(ObjectReceipt {
            id: video_id,
            size,
            filename,
        })
    }

    /// Remove metadata, then every chunk; a missing object reports zero for both.
    /// Counts accumulate in `progress`, so retrying with the same tally reports
    /// what the whole delete removed.
    pub async fn delete(&self, collection: &dyn Collection, id: &str, progress: &DeletionProgress) -> DbResult<ObjectDeletion> {
        let chunks_collection = self.chunk_collection(collection.database_name()).await?;
        let metadata = collection.delete_one(&object_filter(id, DocumentKind::Metadata)?).await?;
        progress.metadata.fetch_add(metadata.deleted_count, Ordering::SeqCst);
        let chunks = chunks_collection
            .delete_many(&object_filter(id, DocumentKind::Chunk)?)
            .await?;
        progress.chunks.fetch_add(chunks.deleted_count, Ordering::SeqCst);

        let totals = progress.totals();
        if totals.metadata_deleted == 0 && totals.chunks_deleted > 0 {
            warn!("Removed {} orphaned chunks of object {}", totals.chunks_deleted, id);
        } else if totals.metadata_deleted > 0 && totals.chunks_deleted == 0 {
            warn!("Object {} had metadata but no chunks", id);
        }
        Ok(totals)
    }

    pub async fn get(&self, collection: &dyn Collection, id: &str) -> DbResult<ObjectContent> {
        let metadata: ObjectMetadata = match collection.find_one(&object_filter(id, DocumentKind::Metadata)?).await? {
            Some(doc) => from_document(doc)?,
            None => return Err(DbError::NotFound),
        };

        let chunks_collection = self.chunk_collection(collection.database_name()).await?;
        let docs = chunks_collection
            .find(
                &object_filter(id, DocumentKind::Chunk)?,
                FindOptions::sorted_by("chunk_index", SortOrder::Ascending),
            )
            .await?;
        if docs.is_empty() {
            return Err(DbError::ChunksMissing(id.to_string()));
        }
        let chunks = docs
            .into_iter()
            .map(from_document::<ChunkDocument>)
            .collect::<DbResult<Vec<_>>>()?;

        let payload = verify_reassembly(&metadata, &chunks)?;
        Ok(ObjectContent {
            id: metadata.video_id,
            video: codec::data_uri(&metadata.content_type, &payload),
            metadata: metadata.metadata,
            filename: metadata.filename,
            size: metadata.size,
            content_type: metadata.content_type,
            created_at: metadata.created_at,
        })
    }
}

/// Reassemble ordered chunks and check them against the metadata
pub fn verify_reassembly(metadata: &ObjectMetadata, chunks: &[ChunkDocument]) -> DbResult<Bytes> {
    let data: Vec<&Bytes> = chunks.iter().map(|chunk| &chunk.data).collect();
    let payload = codec::reassemble(&data);
    if payload.len() as u64 != metadata.size {
        return Err(DbError::Integrity(format!(
            "object {} reassembled to {} bytes, expected {}",
            metadata.video_id,
            payload.len(),
            metadata.size
        )));
    }
    let contiguous = chunks.len() as u64 == metadata.chunk_count
        && chunks
            .iter()
            .enumerate()
            .all(|(expected, chunk)| chunk.chunk_index == expected as u64);
    if !contiguous {
        return Err(DbError::Integrity(format!(
            "object {} chunk indices are not 0..{}",
            metadata.video_id, metadata.chunk_count
        )));
    }
    if codec::checksum(&payload) != metadata.checksum {
        return Err(DbError::Integrity(format!("object {} checksum mismatch", metadata.video_id)));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_store::MemoryStore;
    use crate::store::{ConnectionOptions, DocumentStore};
    use crate::store::config::Connector;
    use serde_json::json;

    fn object_store(store: &MemoryStore, settings: ObjectSettings) -> ObjectStore {
        let store = store.clone();
        let connector = move |_: &str, _: &ConnectionOptions| -> Result<Arc<dyn DocumentStore>, StoreError> {
            Ok(Arc::new(store.clone()))
        };
        let connector: Arc<dyn Connector> = Arc::new(connector);
        let manager = ConnectionManager::with_connector(ConnectionOptions::with_uri("memory://"), connector);
        ObjectStore::new(Arc::new(manager), settings)
    }

    fn new_object(len: usize) -> NewObject {
        NewObject {
            payload: Bytes::from((0..len).map(|i| (i % 253) as u8).collect::<Vec<_>>()),
            content_type: "video/mp4".to_string(),
            metadata: json!({"filename": "clip.mp4"}).as_object().cloned().unwrap(),
            is_private: true,
        }
    }

    #[test]
    fn test_new_object_from_request() {
        let object = NewObject::from_request(json!({
            "video": "data:video/webm;base64,AAEC",
            "metadata": {"filename": "a.webm", "title": "A"},
            "isPrivate": false
        }))
        .unwrap();
        assert_eq!(object.payload.len(), 3);
        assert_eq!(object.content_type, "video/webm");
        assert_eq!(object.filename(), "a.webm");
        assert!(!object.is_private);

        let object = NewObject::from_request(json!({"video": "AAEC"})).unwrap();
        assert!(object.is_private);
        assert_eq!(object.filename(), "untitled");

        assert!(matches!(NewObject::from_request(json!({})), Err(DbError::MissingField(_))));
        assert!(matches!(NewObject::from_request(json!({"video": "data:video/mp4;base64,"})), Err(DbError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_chunk_indices_are_contiguous_across_batches() {
        let store = MemoryStore::new();
        // Small chunks and batches force many batch boundaries
        let objects = object_store(&store, ObjectSettings { chunk_size: 10, batch_size: 3, ..Default::default() });
        let metadata_coll = store.collection("Media", "videos");

        let receipt = objects.create(metadata_coll.as_ref(), &new_object(95)).await.unwrap();
        assert_eq!(receipt.size, 95);
        assert_eq!(receipt.filename, "clip.mp4");

        let chunk_coll = store.collection("Media", CHUNK_COLLECTION);
        let docs = chunk_coll
            .find(&json!({"video_id": receipt.id}).as_object().cloned().unwrap(), FindOptions::default())
            .await
            .unwrap();
        let mut indices: Vec<u64> = docs.iter().map(|d| d["chunk_index"].as_u64().unwrap()).collect();
        indices.sort();
        assert_eq!(indices, (0..10).collect::<Vec<u64>>());

        let meta = metadata_coll.find_one(&json!({"video_id": receipt.id}).as_object().cloned().unwrap()).await.unwrap().unwrap();
        assert_eq!(meta["chunk_count"], json!(10));
        assert_eq!(meta["type"], json!("metadata"));

        let mut names = store.index_names("Media", CHUNK_COLLECTION);
        names.sort();
        assert_eq!(names, vec!["type_1", "video_id_1_chunk_index_1"]);
    }

    #[tokio::test]
    async fn test_get_round_trips_payload() {
        let store = MemoryStore::new();
        let objects = object_store(&store, ObjectSettings::default());
        let coll = store.collection("Media", "videos");
        let object = new_object(CHUNK_SIZE * 2 + 17);

        let receipt = objects.create(coll.as_ref(), &object).await.unwrap();
        let content = objects.get(coll.as_ref(), &receipt.id).await.unwrap();

        assert_eq!(content.size, object.payload.len() as u64);
        assert_eq!(content.video, codec::data_uri("video/mp4", &object.payload));
        assert_eq!(content.filename, "clip.mp4");
        assert_eq!(content.metadata["filename"], json!("clip.mp4"));
    }

    #[tokio::test]
    async fn test_get_failures() {
        let store = MemoryStore::new();
        let objects = object_store(&store, ObjectSettings::default());
        let coll = store.collection("Media", "videos");

        assert!(matches!(objects.get(coll.as_ref(), "nope").await, Err(DbError::NotFound)));

        let receipt = objects.create(coll.as_ref(), &new_object(CHUNK_SIZE * 3)).await.unwrap();
        let chunk_coll = store.collection("Media", CHUNK_COLLECTION);

        // One chunk gone: size no longer matches
        chunk_coll
            .delete_one(&json!({"video_id": receipt.id, "chunk_index": 1}).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert!(matches!(objects.get(coll.as_ref(), &receipt.id).await, Err(DbError::Integrity(_))));

        // All chunks gone
        chunk_coll
            .delete_many(&json!({"video_id": receipt.id}).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert!(matches!(objects.get(coll.as_ref(), &receipt.id).await, Err(DbError::ChunksMissing(_))));
    }

    #[tokio::test]
    async fn test_delete_reports_counts() {
        let store = MemoryStore::new();
        let objects = object_store(&store, ObjectSettings::default());
        let coll = store.collection("Media", "videos");
        let receipt = objects.create(coll.as_ref(), &new_object(CHUNK_SIZE + 1)).await.unwrap();

        let deletion = objects.delete(coll.as_ref(), &receipt.id, &DeletionProgress::new()).await.unwrap();
        assert_eq!((deletion.metadata_deleted, deletion.chunks_deleted), (1, 2));

        let deletion = objects.delete(coll.as_ref(), &receipt.id, &DeletionProgress::new()).await.unwrap();
        assert_eq!((deletion.metadata_deleted, deletion.chunks_deleted), (0, 0));
        assert_eq!(store.document_count("Media", CHUNK_COLLECTION), 0);
    }

    #[tokio::test]
    async fn test_interrupted_delete_keeps_earlier_counts() {
        let store = MemoryStore::new();
        let objects = object_store(&store, ObjectSettings::default());
        let coll = store.collection("Media", "videos");
        let receipt = objects.create(coll.as_ref(), &new_object(CHUNK_SIZE * 2 + 1)).await.unwrap();
        let progress = DeletionProgress::new();

        // Metadata goes, then the chunk delete fails
        store.fail_operations_after(1, 1);
        assert!(objects.delete(coll.as_ref(), &receipt.id, &progress).await.is_err());
        assert_eq!(store.document_count("Media", "videos"), 0);
        assert_eq!(store.document_count("Media", CHUNK_COLLECTION), 3);

        let deletion = objects.delete(coll.as_ref(), &receipt.id, &progress).await.unwrap();
        assert_eq!((deletion.metadata_deleted, deletion.chunks_deleted), (1, 3));
        assert_eq!(store.document_count("Media", CHUNK_COLLECTION), 0);
    }

    #[test]
    fn test_verify_reassembly_detects_tampering() {
        let payload = Bytes::from_static(b"abcdefghij");
        let chunks: Vec<ChunkDocument> = codec::split_into_chunks(&payload, 4)
            .into_iter()
            .enumerate()
            .map(|(i, data)| ChunkDocument { video_id: "v".into(), chunk_index: i as u64, data, kind: DocumentKind::Chunk })
            .collect();
        let metadata = ObjectMetadata {
            video_id: "v".into(),
            metadata: Document::new(),
            filename: "f".into(),
            size: 10,
            content_type: "video/mp4".into(),
            checksum: codec::checksum(&payload),
            created_at: json!("2024-01-01T00:00:00.000Z"),
            is_private: true,
            chunk_count: 3,
            kind: DocumentKind::Metadata,
        };
        assert_eq!(verify_reassembly(&metadata, &chunks).unwrap(), payload);

        // Same length, wrong bytes
        let mut corrupted = chunks.clone();
        corrupted[0].data = Bytes::from_static(b"zzzz");
        assert!(matches!(verify_reassembly(&metadata, &corrupted), Err(DbError::Integrity(_))));

        // Duplicate index where a gap should be
        let mut misnumbered = chunks.clone();
        misnumbered[2].chunk_index = 1;
        assert!(matches!(verify_reassembly(&metadata, &misnumbered), Err(DbError::Integrity(_))));
    }
}
