//! Connection Manager
//!
//! Owns the lazily opened store handle. The first caller opens the
//! connection, verifies it with a bounded ping retry, and bootstraps the
//! default indexes. If the URI is missing the manager fails fast with a
//! configuration error and stays unconnected; if the store cannot be reached
//! it also stays unconnected, and the next call tries again.

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cache::{CollectionCache, IndexCache};
use crate::error::{DbError, DbResult};
use crate::retry::RetryPolicy;
use crate::store::document::index_name;
use crate::store::{Collection, ConnectionOptions, Connector, DocumentStore, UriConnector, SYSTEM_DATABASES};

/// Fields indexed on every collection found at startup
pub const DEFAULT_INDEX_FIELDS: [&str; 3] = ["isPrivate", "created_at", "id"];

pub struct ConnectionManager {
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    verify_policy: RetryPolicy,
    handle: Mutex<Option<Arc<dyn DocumentStore>>>,
    collections: CollectionCache,
    indexes: IndexCache,
}

impl ConnectionManager {
    /// Manager that picks the driver from the URI scheme
    pub fn new(options: ConnectionOptions) -> Self {
        Self::with_connector(options, Arc::new(UriConnector))
    }

    pub fn with_connector(options: ConnectionOptions, connector: Arc<dyn Connector>) -> Self {
        Self {
            options,
            connector,
            verify_policy: RetryPolicy::connection(),
            handle: Mutex::new(None),
            collections: CollectionCache::new(),
            indexes: IndexCache::new(),
        }
    }

    pub fn with_verify_policy(mut self, policy: RetryPolicy) -> Self {
        self.verify_policy = policy;
        self
    }

    pub fn collection_cache(&self) -> &CollectionCache {
        &self.collections
    }

    pub fn index_cache(&self) -> &IndexCache {
        &self.indexes
    }

    pub async fn is_connected(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Return the live store handle, opening and verifying it if needed
    pub async fn ensure_connection(&self) -> DbResult<Arc<dyn DocumentStore>> {
        let mut handle = self.handle.lock().await;
        if let Some(store) = handle.as_ref() {
            return Ok(store.clone());
        }

        let uri = self
            .options
            .uri
            .as_deref()
            .filter(|uri| !uri.trim().is_empty())
            .ok_or_else(|| {
                error!("Document store URI not configured");
                DbError::Configuration("document store URI not configured".to_string())
            })?;

        let store = self.connector.connect(uri, &self.options).map_err(|e| {
            error!("Database initialization error: {}", e);
            DbError::ConnectionUnavailable
        })?;

        self.verify(store.as_ref()).await?;
        self.bootstrap_indexes(store.as_ref()).await;

        *handle = Some(store.clone());
        Ok(store)
    }

    /// Ping with bounded backoff; failure leaves the manager unconnected
    async fn verify(&self, store: &dyn DocumentStore) -> DbResult<()> {
        match self
            .verify_policy
            .run("connection verification", move || async move { store.ping().await.map_err(DbError::from) })
            .await
        {
            Ok(()) => {
                info!("Connected to document store successfully");
                Ok(())
            }
            Err(e) => {
                error!("Connection verification failed: {}", e);
                Err(DbError::ConnectionUnavailable)
            }
        }
    }

    /// Best-effort creation of the default indexes on every user collection
    pub async fn bootstrap_indexes(&self, store: &dyn DocumentStore) {
        let databases = match store.list_databases().await {
            Ok(databases) => databases,
            Err(e) => {
                warn!("Warning: Error setting up indexes: {}", e);
                return;
            }
        };

        for database in databases.iter().filter(|db| !SYSTEM_DATABASES.contains(&db.as_str())) {
            let collections = match store.list_collections(database).await {
                Ok(collections) => collections,
                Err(e) => {
                    warn!("Warning: Could not access database {}: {}", database, e);
                    continue;
                }
            };
            for collection in collections {
                let handle = store.collection(database, &collection);
                for field in DEFAULT_INDEX_FIELDS {
                    let keys = [(field.to_string(), 1)];
                    let name = index_name(&keys);
                    if self.indexes.contains(database, &collection, &name) {
                        continue;
                    }
                    match handle.create_index(&keys).await {
                        Ok(_) => {
                            self.indexes.insert(database, &collection, &name);
                        }
                        Err(e) => warn!(
                            "Warning: Could not create index on {}.{}: {}",
                            database, collection, e
                        ),
                    }
                }
            }
        }
        debug!("Index bootstrap complete, {} indexes recorded", self.indexes.len());
    }

    /// Memoized collection handle; opens the connection on first use
    pub async fn get_collection(&self, database: &str, collection: &str) -> DbResult<Arc<dyn Collection>> {
        if database.is_empty() || collection.is_empty() {
            return Err(DbError::MissingCollection);
        }
        if let Some(handle) = self.collections.get(database, collection) {
            return Ok(handle);
        }
        let store = self.ensure_connection().await?;
        Ok(self
            .collections
            .get_or_insert_with(database, collection, || store.collection(database, collection)))
    }

    /// Create an index once per process, remembering it in the index cache
    pub async fn ensure_index(&self, collection: &dyn Collection, keys: &[(String, i32)]) -> DbResult<()> {
        let name = index_name(keys);
        let (database, coll) = (collection.database_name(), collection.collection_name());
        if self.indexes.contains(database, coll, &name) {
            return Ok(());
        }
        collection.create_index(keys).await?;
        self.indexes.insert(database, coll, &name);
        Ok(())
    }

    /// Drop the handle and both caches; the next call reconnects
    pub async fn reset(&self) {
        let store = self.handle.lock().await.take();
        self.collections.clear();
        self.indexes.clear();
        if let Some(store) = store {
            if let Err(e) = store.close().await {
                warn!("Error closing document store: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::memory_store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn manager_for(store: &MemoryStore) -> ConnectionManager {
        let store = store.clone();
        let connector = move |_: &str, _: &ConnectionOptions| -> Result<Arc<dyn DocumentStore>, StoreError> {
            Ok(Arc::new(store.clone()))
        };
        ConnectionManager::with_connector(ConnectionOptions::with_uri("memory://"), Arc::new(connector))
    }

    #[tokio::test]
    async fn test_missing_uri_is_configuration_error() {
        let manager = ConnectionManager::new(ConnectionOptions::default());
        assert!(matches!(manager.ensure_connection().await, Err(DbError::Configuration(_))));
        assert!(!manager.is_connected().await);
        // Still short-circuits on the next call
        assert!(matches!(manager.get_collection("DB", "items").await, Err(DbError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let store = MemoryStore::new();
        let manager = manager_for(&store);
        manager.ensure_connection().await.unwrap();
        manager.ensure_connection().await.unwrap();
        assert_eq!(store.ping_count(), 1);
        assert!(manager.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_retries_with_backoff() {
        let store = MemoryStore::new();
        store.fail_next_pings(2);
        let manager = manager_for(&store);
        let start = Instant::now();

        manager.ensure_connection().await.unwrap();

        assert_eq!(store.ping_count(), 3);
        // 1s + 2s of backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_store_leaves_manager_unconnected() {
        let store = MemoryStore::new();
        store.fail_next_pings(3);
        let manager = manager_for(&store);

        assert!(matches!(manager.ensure_connection().await, Err(DbError::ConnectionUnavailable)));
        assert!(!manager.is_connected().await);
        // Injected failures are used up, so a later call re-initializes
        manager.get_collection("DB", "items").await.unwrap();
        assert!(manager.is_connected().await);
        assert_eq!(store.ping_count(), 4);
    }

    #[tokio::test]
    async fn test_connector_failure_is_unavailable() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let connector = move |_: &str, _: &ConnectionOptions| -> Result<Arc<dyn DocumentStore>, StoreError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Connection("refused".to_string()))
        };
        let manager = ConnectionManager::with_connector(ConnectionOptions::with_uri("memory://"), Arc::new(connector));

        assert!(matches!(manager.get_collection("DB", "items").await, Err(DbError::ConnectionUnavailable)));
        assert!(matches!(manager.get_collection("DB", "items").await, Err(DbError::ConnectionUnavailable)));
        // Every call re-attempts initialization
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_indexes_skips_system_databases() {
        let store = MemoryStore::new();
        store.collection("AppDB", "users").insert_one(json!({"a": 1}).as_object().cloned().unwrap()).await.unwrap();
        store.collection("admin", "system").insert_one(json!({"a": 1}).as_object().cloned().unwrap()).await.unwrap();
        let manager = manager_for(&store);

        manager.ensure_connection().await.unwrap();

        let mut names = store.index_names("AppDB", "users");
        names.sort();
        assert_eq!(names, vec!["created_at_1", "id_1", "isPrivate_1"]);
        assert!(store.index_names("admin", "system").is_empty());
        assert!(manager.index_cache().contains("AppDB", "users", "isPrivate_1"));
        assert_eq!(manager.index_cache().len(), 3);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_not_fatal() {
        let store = MemoryStore::new();
        store.collection("AppDB", "users").insert_one(json!({"a": 1}).as_object().cloned().unwrap()).await.unwrap();
        let manager = manager_for(&store);

        // list_databases fails; the connection still comes up
        store.fail_next_operations(1);
        manager.ensure_connection().await.unwrap();
        assert!(manager.index_cache().is_empty());
    }

    #[tokio::test]
    async fn test_get_collection_caches_and_reset() {
        let store = MemoryStore::new();
        let manager = manager_for(&store);

        let first = manager.get_collection("DB", "items").await.unwrap();
        let second = manager.get_collection("DB", "items").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.collection_cache().len(), 1);

        assert!(matches!(manager.get_collection("DB", "").await, Err(DbError::MissingCollection)));

        manager.reset().await;
        assert!(!manager.is_connected().await);
        assert!(manager.collection_cache().is_empty());
        manager.get_collection("DB", "items").await.unwrap();
        assert_eq!(store.ping_count(), 2);
    }

    #[tokio::test]
    async fn test_ensure_index_uses_cache() {
        let store = MemoryStore::new();
        let manager = manager_for(&store);
        let coll = manager.get_collection("DB", "video_chunks").await.unwrap();
        let keys = vec![("video_id".to_string(), 1), ("chunk_index".to_string(), 1)];

        manager.ensure_index(coll.as_ref(), &keys).await.unwrap();
        assert!(manager.index_cache().contains("DB", "video_chunks", "video_id_1_chunk_index_1"));

        // A cached index is not created again, even if the store would fail
        store.fail_next_operations(1);
        manager.ensure_index(coll.as_ref(), &keys).await.unwrap();
    }
}
