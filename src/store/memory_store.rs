//! In-process implementation of the DocumentStore trait
//!
//! Used by the test suites and for ephemeral deployments. Clones share the
//! same data, so a test can keep a handle while the engine opens its own.

use async_trait::async_trait;
use log::debug;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StoreError;
use crate::store::document::{self, Document, FindOptions, Update};
use crate::store::{ensure_id, Collection, CollectionStats, DatabaseStats, DeleteResult, DocumentStore, UpdateResult};

#[derive(Debug, Default)]
struct CollectionData {
    docs: Vec<Document>,
    indexes: BTreeMap<String, Vec<(String, i32)>>,
}

type Databases = BTreeMap<String, BTreeMap<String, CollectionData>>;

#[derive(Debug, Default)]
struct Shared {
    data: Mutex<Databases>,
    ping_failures: AtomicU32,
    operation_failures: AtomicU32,
    operations_before_failure: AtomicU32,
    pings: AtomicU32,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Databases>, StoreError> {
        self.data
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    /// Decrement the counter if it is above zero
    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_operation(&self) -> Result<(), StoreError> {
        if self.operation_failures.load(Ordering::SeqCst) > 0 && Self::take_one(&self.operations_before_failure) {
            return Ok(());
        }
        if Self::take_one(&self.operation_failures) {
            return Err(StoreError::Backend("injected operation failure".to_string()));
        }
        Ok(())
    }
}

/// In-memory document store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` pings fail
    pub fn fail_next_pings(&self, n: u32) {
        self.shared.ping_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` collection operations fail with a transient error
    pub fn fail_next_operations(&self, n: u32) {
        self.fail_operations_after(0, n);
    }

    /// Let `successes` operations through, then fail the following `failures`
    pub fn fail_operations_after(&self, successes: u32, failures: u32) {
        self.shared.operations_before_failure.store(successes, Ordering::SeqCst);
        self.shared.operation_failures.store(failures, Ordering::SeqCst);
    }

    /// Number of pings received so far
    pub fn ping_count(&self) -> u32 {
        self.shared.pings.load(Ordering::SeqCst)
    }

    /// Number of documents in a collection, zero when it does not exist
    pub fn document_count(&self, database: &str, collection: &str) -> usize {
        self.shared
            .lock()
            .map(|data| {
                data.get(database)
                    .and_then(|db| db.get(collection))
                    .map(|coll| coll.docs.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Names of the indexes created on a collection
    pub fn index_names(&self, database: &str, collection: &str) -> Vec<String> {
        self.shared
            .lock()
            .map(|data| {
                data.get(database)
                    .and_then(|db| db.get(collection))
                    .map(|coll| coll.indexes.keys().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Remove all data from the store
    pub fn clear(&self) {
        if let Ok(mut data) = self.shared.lock() {
            data.clear();
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.shared.pings.fetch_add(1, Ordering::SeqCst);
        if Shared::take_one(&self.shared.ping_failures) {
            return Err(StoreError::Connection("injected ping failure".to_string()));
        }
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>, StoreError> {
        self.shared.check_operation()?;
        let data = self.shared.lock()?;
        Ok(data
            .iter()
            .filter(|(_, collections)| !collections.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        self.shared.check_operation()?;
        let data = self.shared.lock()?;
        Ok(data
            .get(database)
            .map(|collections| collections.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn collection(&self, database: &str, collection: &str) -> Arc<dyn Collection> {
        Arc::new(MemoryCollection {
            shared: self.shared.clone(),
            database: database.to_string(),
            collection: collection.to_string(),
        })
    }

    async fn database_stats(&self, database: &str) -> Result<DatabaseStats, StoreError> {
        self.shared.check_operation()?;
        let data = self.shared.lock()?;
        let stats: Vec<CollectionStats> = data
            .get(database)
            .map(|collections| collections.values().map(estimate).collect())
            .unwrap_or_default();
        Ok(DatabaseStats::aggregate(&stats, 0))
    }

    async fn collection_stats(&self, database: &str, collection: &str) -> Result<CollectionStats, StoreError> {
        self.shared.check_operation()?;
        let data = self.shared.lock()?;
        Ok(data
            .get(database)
            .and_then(|collections| collections.get(collection))
            .map(estimate)
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), StoreError> {
        debug!("Memory store connection closed");
        Ok(())
    }
}

fn estimate(coll: &CollectionData) -> CollectionStats {
    let keys: Vec<Vec<(String, i32)>> = coll.indexes.values().cloned().collect();
    CollectionStats::estimate(&coll.docs, &keys)
}

/// Collection handle into a MemoryStore
struct MemoryCollection {
    shared: Arc<Shared>,
    database: String,
    collection: String,
}

impl MemoryCollection {
    /// Run `f` against this collection, creating it when `create` is set
    fn with_collection<T>(
        &self,
        create: bool,
        f: impl FnOnce(&mut CollectionData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.shared.check_operation()?;
        let mut data = self.shared.lock()?;
        if create {
            let coll = data
                .entry(self.database.clone())
                .or_default()
                .entry(self.collection.clone())
                .or_default();
            return f(coll);
        }
        match data.get_mut(&self.database).and_then(|db| db.get_mut(&self.collection)) {
            Some(coll) => f(coll),
            None => f(&mut CollectionData::default()),
        }
    }

    fn first_match(docs: &[Document], filter: &Document) -> Result<Option<usize>, StoreError> {
        for (position, doc) in docs.iter().enumerate() {
            if document::matches(doc, filter)? {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }
}

fn insert_into(coll: &mut CollectionData, mut doc: Document) -> Result<String, StoreError> {
    let id = ensure_id(&mut doc);
    if coll
        .docs
        .iter()
        .any(|existing| existing.get(document::ID_FIELD).and_then(|v| v.as_str()) == Some(id.as_str()))
    {
        return Err(StoreError::DuplicateKey(id));
    }
    coll.docs.push(doc);
    Ok(id)
}

#[async_trait]
impl Collection for MemoryCollection {
    fn database_name(&self) -> &str {
        &self.database
    }

    fn collection_name(&self) -> &str {
        &self.collection
    }

    async fn insert_one(&self, doc: Document) -> Result<String, StoreError> {
        self.with_collection(true, |coll| insert_into(coll, doc))
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<Vec<String>, StoreError> {
        self.with_collection(true, |coll| {
            docs.into_iter().map(|doc| insert_into(coll, doc)).collect()
        })
    }

    async fn find(&self, filter: &Document, options: FindOptions) -> Result<Vec<Document>, StoreError> {
        self.with_collection(false, |coll| document::select(coll.docs.iter().cloned(), filter, &options))
    }

    async fn find_one(&self, filter: &Document) -> Result<Option<Document>, StoreError> {
        self.with_collection(false, |coll| {
            Ok(Self::first_match(&coll.docs, filter)?.map(|position| coll.docs[position].clone()))
        })
    }

    async fn update_one(&self, filter: &Document, update: &Update) -> Result<UpdateResult, StoreError> {
        self.with_collection(false, |coll| {
            let mut result = UpdateResult {
                acknowledged: true,
                ..Default::default()
            };
            if let Some(position) = Self::first_match(&coll.docs, filter)? {
                result.matched_count = 1;
                if document::apply_update(&mut coll.docs[position], update)? {
                    result.modified_count = 1;
                }
            }
            Ok(result)
        })
    }

    async fn delete_one(&self, filter: &Document) -> Result<DeleteResult, StoreError> {
        self.with_collection(false, |coll| {
            let deleted_count = match Self::first_match(&coll.docs, filter)? {
                Some(position) => {
                    coll.docs.remove(position);
                    1
                }
                None => 0,
            };
            Ok(DeleteResult {
                acknowledged: true,
                deleted_count,
            })
        })
    }

    async fn delete_many(&self, filter: &Document) -> Result<DeleteResult, StoreError> {
        self.with_collection(false, |coll| {
            // Evaluate every filter before touching the data
            let mut doomed = Vec::with_capacity(coll.docs.len());
            for doc in &coll.docs {
                doomed.push(document::matches(doc, filter)?);
            }
            let mut flags = doomed.iter();
            coll.docs.retain(|_| !flags.next().copied().unwrap_or(false));
            Ok(DeleteResult {
                acknowledged: true,
                deleted_count: doomed.iter().filter(|&&d| d).count() as u64,
            })
        })
    }

    async fn count_documents(&self, filter: &Document, limit: Option<u64>) -> Result<u64, StoreError> {
        self.with_collection(false, |coll| {
            let mut count = 0u64;
            for doc in &coll.docs {
                if limit.is_some_and(|limit| count >= limit) {
                    break;
                }
                if document::matches(doc, filter)? {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    async fn create_index(&self, keys: &[(String, i32)]) -> Result<String, StoreError> {
        let name = document::index_name(keys);
        self.with_collection(true, |coll| {
            coll.indexes.entry(name.clone()).or_insert_with(|| keys.to_vec());
            Ok(name)
        })
    }
}
