//! Configuration for document store drivers

use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use crate::store::memory_store::MemoryStore;
use crate::store::sqlite_store::SqliteStore;
use crate::store::DocumentStore;

/// Available document store drivers
#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    Memory,
    Sqlite(PathBuf),
}

impl std::str::FromStr for StoreBackend {
    type Err = StoreError;

    /// Parse a store URI such as `memory://` or `sqlite://./data/store.db`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| StoreError::UnsupportedUri(s.to_string()))?;
        match scheme.to_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreBackend::Memory),
            "sqlite" if !rest.is_empty() => Ok(StoreBackend::Sqlite(PathBuf::from(rest))),
            _ => Err(StoreError::UnsupportedUri(s.to_string())),
        }
    }
}

/// Connection settings handed to a connector
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub uri: Option<String>,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub server_selection_timeout: Duration,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            uri: None,
            max_pool_size: 100,
            min_pool_size: 20,
            server_selection_timeout: Duration::from_millis(5000),
            connect_timeout: Duration::from_millis(5000),
            socket_timeout: Duration::from_millis(5000),
        }
    }
}

impl ConnectionOptions {
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Default::default()
        }
    }
}

/// Opens connections to a document store
pub trait Connector: Send + Sync {
    fn connect(&self, uri: &str, options: &ConnectionOptions) -> Result<Arc<dyn DocumentStore>, StoreError>;
}

impl<F> Connector for F
where
    F: Fn(&str, &ConnectionOptions) -> Result<Arc<dyn DocumentStore>, StoreError> + Send + Sync,
{
    fn connect(&self, uri: &str, options: &ConnectionOptions) -> Result<Arc<dyn DocumentStore>, StoreError> {
        self(uri, options)
    }
}

/// Picks the driver from the URI scheme
#[derive(Debug, Clone, Copy, Default)]
pub struct UriConnector;

impl Connector for UriConnector {
    fn connect(&self, uri: &str, options: &ConnectionOptions) -> Result<Arc<dyn DocumentStore>, StoreError> {
        match uri.parse::<StoreBackend>()? {
            StoreBackend::Memory => {
                info!("Creating in-memory document store");
                Ok(Arc::new(MemoryStore::new()))
            }
            StoreBackend::Sqlite(path) => {
                info!("Opening SQLite document store at {}", path.display());
                Ok(Arc::new(SqliteStore::open(&path, options.socket_timeout)?))
            }
        }
    }
}
