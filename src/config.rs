//! Application Configuration
//!
//! This module provides configuration management for the application,
//! supporting YAML configuration files with sensible defaults.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::dispatcher::DEFAULT_DATABASE;
use crate::monitor::MonitorSettings;
use crate::objects::{ObjectSettings, CHUNK_BATCH_SIZE, CHUNK_COLLECTION, CHUNK_SIZE};
use crate::retry::RetryPolicy;
use crate::store::ConnectionOptions;

/// Environment variable overriding `store.uri`
pub const STORE_URI_ENV: &str = "DOCUMENT_STORE_URI";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Document store configuration
    pub store: StoreConfig,
    /// Retry around dispatched commands
    pub dispatcher: RetryConfig,
    /// Retry around the connection liveness check
    pub connection: RetryConfig,
    /// Chunked object store configuration
    pub objects: ObjectsConfig,
    /// Storage monitor configuration
    pub monitor: MonitorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Number of worker threads
    pub workers: usize,
    /// Maximum payload size in bytes
    pub max_payload_size: usize,
}

/// Document store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store location, e.g. `sqlite://./data/vornify.db` or `memory://`
    pub uri: Option<String>,
    /// Database used when a request names none
    pub default_database: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub server_selection_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub socket_timeout_ms: u64,
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled after each failure
    pub initial_delay_ms: u64,
}

/// Chunked object store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectsConfig {
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Chunks written per insert
    pub batch_size: usize,
    pub chunk_collection: String,
}

/// Storage monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub ledger_database: String,
    pub ledger_collection: String,
    /// History window in days
    pub history_days: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Path to log configuration file
    pub config_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3010,
            workers: 4,
            max_payload_size: 1024 * 1024 * 1024, // 1GB
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: None,
            default_database: DEFAULT_DATABASE.to_string(),
            max_pool_size: 100,
            min_pool_size: 20,
            server_selection_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            socket_timeout_ms: 5000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.initial_delay_ms))
    }

    fn from_policy(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
        }
    }
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            batch_size: CHUNK_BATCH_SIZE,
            chunk_collection: CHUNK_COLLECTION.to_string(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let settings = MonitorSettings::default();
        Self {
            ledger_database: settings.ledger_database,
            ledger_collection: settings.ledger_collection,
            history_days: settings.history_days,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            config_file: "server_log.yaml".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            dispatcher: RetryConfig::from_policy(RetryPolicy::dispatch()),
            connection: RetryConfig::from_policy(RetryPolicy::connection()),
            objects: ObjectsConfig::default(),
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            uri: self.uri.clone(),
            max_pool_size: self.max_pool_size,
            min_pool_size: self.min_pool_size,
            server_selection_timeout: Duration::from_millis(self.server_selection_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            socket_timeout: Duration::from_millis(self.socket_timeout_ms),
        }
    }
}

impl ObjectsConfig {
    pub fn settings(&self) -> ObjectSettings {
        ObjectSettings {
            chunk_size: self.chunk_size,
            batch_size: self.batch_size,
            chunk_collection: self.chunk_collection.clone(),
        }
    }
}

impl MonitorConfig {
    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            ledger_database: self.ledger_database.clone(),
            ledger_collection: self.ledger_collection.clone(),
            history_days: self.history_days,
        }
    }
}

impl AppConfig {
    /// Load configuration from file, use defaults if not found
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_from("config.yaml")
    }

    pub fn load_from(config_path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = config_path.as_ref();
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            let config: AppConfig = serde_yaml::from_str(&content)?;
            info!("Loaded configuration from {}", config_path.display());
            config
        } else {
            warn!("Config file not found, using defaults");
            Self::default()
        };
        config.apply_env(std::env::var(STORE_URI_ENV).ok());
        Ok(config)
    }

    /// A non-empty environment URI wins over the file
    pub fn apply_env(&mut self, store_uri: Option<String>) {
        if let Some(uri) = store_uri.filter(|uri| !uri.trim().is_empty()) {
            info!("Using document store URI from {}", STORE_URI_ENV);
            self.store.uri = Some(uri);
        }
    }
}
