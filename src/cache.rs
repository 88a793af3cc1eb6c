//! Collection handle and index-creation caches
//!
//! Both are keyed by (database, collection) and filled on first use. They are
//! owned by the connection manager rather than held as statics, so tests get
//! a fresh pair per manager and callers can invalidate by key.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::store::Collection;

type Namespace = (String, String);

fn namespace(database: &str, collection: &str) -> Namespace {
    (database.to_string(), collection.to_string())
}

/// Memoized collection handles
#[derive(Default)]
pub struct CollectionCache {
    entries: RwLock<HashMap<Namespace, Arc<dyn Collection>>>,
}

impl CollectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, database: &str, collection: &str) -> Option<Arc<dyn Collection>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&namespace(database, collection))
            .cloned()
    }

    /// Return the cached handle or store the one `make` builds
    pub fn get_or_insert_with(
        &self,
        database: &str,
        collection: &str,
        make: impl FnOnce() -> Arc<dyn Collection>,
    ) -> Arc<dyn Collection> {
        if let Some(handle) = self.get(database, collection) {
            return handle;
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace(database, collection))
            .or_insert_with(make)
            .clone()
    }

    pub fn invalidate(&self, database: &str, collection: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&namespace(database, collection))
            .is_some()
    }

    /// Drop every handle belonging to one database
    pub fn invalidate_database(&self, database: &str) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(db, _), _| db != database);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Names of the indexes already created, per collection
#[derive(Debug, Default)]
pub struct IndexCache {
    created: RwLock<HashMap<Namespace, HashSet<String>>>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, database: &str, collection: &str, index: &str) -> bool {
        self.created
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&namespace(database, collection))
            .is_some_and(|names| names.contains(index))
    }

    /// Returns false when the index was already recorded
    pub fn insert(&self, database: &str, collection: &str, index: &str) -> bool {
        self.created
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace(database, collection))
            .or_default()
            .insert(index.to_string())
    }

    pub fn invalidate_collection(&self, database: &str, collection: &str) -> usize {
        self.created
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&namespace(database, collection))
            .map_or(0, |names| names.len())
    }

    pub fn clear(&self) {
        self.created.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.created
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(HashSet::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
