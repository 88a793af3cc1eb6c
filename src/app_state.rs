//! Application State Management
//!
//! This module provides the application state that contains all services
//! and their dependencies, following the dependency injection pattern.

use log::{info, warn};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::connection::ConnectionManager;
use crate::dispatcher::Dispatcher;
use crate::error::StoreError;
use crate::monitor::StorageMonitor;
use crate::objects::ObjectStore;
use crate::store::memory_store::MemoryStore;
use crate::store::{ConnectionOptions, Connector, DocumentStore, StoreBackend, UriConnector};

/// Application state containing all services and their dependencies
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub monitor: Arc<StorageMonitor>,
    pub config: AppConfig,
}

/// Connector that always hands out the same in-process store
pub fn shared_memory_connector(store: MemoryStore) -> Arc<dyn Connector> {
    Arc::new(move |_: &str, _: &ConnectionOptions| -> Result<Arc<dyn DocumentStore>, StoreError> {
        Ok(Arc::new(store.clone()))
    })
}

impl AppState {
    /// Create a new application state with services configured from YAML config
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let config = AppConfig::load()?;
        Ok(Self::from_config(config))
    }

    /// Create application state from configuration
    pub fn from_config(config: AppConfig) -> Self {
        info!("Initializing application state with configuration");

        // Monitor and dispatcher open separate connections; for the memory
        // driver they must still see the same data
        let connector: Arc<dyn Connector> = match config.store.uri.as_deref().map(str::parse::<StoreBackend>) {
            Some(Ok(StoreBackend::Memory)) => {
                info!("Using shared in-memory document store");
                shared_memory_connector(MemoryStore::new())
            }
            Some(Ok(StoreBackend::Sqlite(path))) => {
                info!("Using SQLite document store at {}", path.display());
                Arc::new(UriConnector)
            }
            Some(Err(e)) => {
                warn!("Unsupported document store URI: {}", e);
                Arc::new(UriConnector)
            }
            None => {
                warn!("No document store URI configured; operations will fail until one is set");
                Arc::new(UriConnector)
            }
        };

        Self::with_connector(config, connector)
    }

    /// Create application state for testing with a fresh in-memory store
    pub fn new_for_testing() -> Self {
        Self::for_memory_store(MemoryStore::new())
    }

    /// Testing state over a store the caller keeps a handle to
    pub fn for_memory_store(store: MemoryStore) -> Self {
        let mut config = AppConfig::default();
        config.store.uri = Some("memory://".to_string());
        Self::with_connector(config, shared_memory_connector(store))
    }

    fn with_connector(config: AppConfig, connector: Arc<dyn Connector>) -> Self {
        let options = config.store.connection_options();

        let connection = Arc::new(
            ConnectionManager::with_connector(options.clone(), connector.clone())
                .with_verify_policy(config.connection.policy()),
        );
        let objects = ObjectStore::new(connection.clone(), config.objects.settings());
        let dispatcher = Dispatcher::new(connection, objects)
            .with_retry_policy(config.dispatcher.policy())
            .with_default_database(config.store.default_database.clone());
        let monitor = StorageMonitor::with_connector(options, config.monitor.settings(), connector);

        info!("Application state initialized successfully");
        Self {
            dispatcher: Arc::new(dispatcher),
            monitor: Arc::new(monitor),
            config,
        }
    }
}
