//! Storage Monitor
//!
//! Reports size and usage figures for one database and keeps a ledger of
//! dated snapshots. Runs beside the dispatcher, not through it: every call
//! opens its own connection and closes it again before returning.

use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{DbError, DbResult, StoreError};
use crate::store::document::{timestamp_value, Document, FindOptions, SortOrder};
use crate::store::{ConnectionOptions, Connector, DocumentStore, UriConnector};

pub const LEDGER_DATABASE: &str = "VornifyDB";
pub const LEDGER_COLLECTION: &str = "storage_history";
pub const HISTORY_DAYS: i64 = 30;

/// Where snapshots are kept and how far back history reaches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub ledger_database: String,
    pub ledger_collection: String,
    pub history_days: i64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            ledger_database: LEDGER_DATABASE.to_string(),
            ledger_collection: LEDGER_COLLECTION.to_string(),
            history_days: HISTORY_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionUsage {
    pub name: String,
    pub size: u64,
    pub storage_size: u64,
    pub document_count: u64,
    pub avg_document_size: u64,
    pub indexes: u64,
    pub index_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_size: u64,
    pub storage_size: u64,
    pub indexes: u64,
    pub total_index_size: u64,
    pub collections: Vec<CollectionUsage>,
    pub avg_document_size: u64,
    pub free_space: u64,
    pub scale_factor: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub timestamp: Value,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub document_count: u64,
}

/// Ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSnapshot {
    pub database: String,
    pub timestamp: Value,
    pub total_size: u64,
    pub storage_size: u64,
    pub document_count: u64,
    pub index_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub status: bool,
    pub database: String,
    pub timestamp: Value,
    pub stats: UsageSummary,
    pub history: Vec<HistoryPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageFailure {
    pub status: bool,
    pub error: String,
    pub details: String,
}

/// What `get_stats` hands to the boundary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StorageReport {
    Ready(StorageStats),
    Failed(StorageFailure),
}

impl StorageReport {
    pub fn is_ok(&self) -> bool {
        matches!(self, StorageReport::Ready(_))
    }
}

/// Ledger query for one database since a point in time
pub fn history_filter(database: &str, since: DateTime<Utc>) -> Document {
    let filter = json!({
        "database": database,
        "timestamp": { "$gte": timestamp_value(since) }
    });
    match filter {
        Value::Object(filter) => filter,
        _ => Document::new(),
    }
}

pub struct StorageMonitor {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    settings: MonitorSettings,
}

impl StorageMonitor {
    pub fn new(options: ConnectionOptions, settings: MonitorSettings) -> Self {
        Self::with_connector(options, settings, Arc::new(UriConnector))
    }

    pub fn with_connector(options: ConnectionOptions, settings: MonitorSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            options,
            settings,
        }
    }

    fn open(&self) -> DbResult<Arc<dyn DocumentStore>> {
        let uri = self
            .options
            .uri
            .as_deref()
            .filter(|uri| !uri.trim().is_empty())
            .ok_or_else(|| DbError::Configuration("document store URI not configured".to_string()))?;
        Ok(self.connector.connect(uri, &self.options)?)
    }

    async fn close(store: Arc<dyn DocumentStore>) {
        if let Err(e) = store.close().await {
            warn!("Error closing monitor connection: {}", e);
        }
    }

    pub async fn get_stats(&self, database: &str) -> StorageReport {
        self.get_stats_at(database, Utc::now()).await
    }

    /// Usage report with history relative to `now`
    pub async fn get_stats_at(&self, database: &str, now: DateTime<Utc>) -> StorageReport {
        let result = match self.open() {
            Ok(store) => {
                let result = self.collect(store.as_ref(), database, now).await;
                Self::close(store).await;
                result
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(stats) => StorageReport::Ready(stats),
            Err(e) => {
                error!("Storage stats error: {}", e);
                StorageReport::Failed(StorageFailure {
                    status: false,
                    error: "Failed to get storage statistics".to_string(),
                    details: e.to_string(),
                })
            }
        }
    }

    async fn collect(&self, store: &dyn DocumentStore, database: &str, now: DateTime<Utc>) -> DbResult<StorageStats> {
        let db_stats = store.database_stats(database).await?;
        let names = store.list_collections(database).await?;

        // Independent read-only queries
        let collections = try_join_all(names.iter().map(|name| async move {
            let stats = store.collection_stats(database, name).await?;
            Ok::<_, StoreError>(CollectionUsage {
                name: name.clone(),
                size: stats.size,
                storage_size: stats.storage_size,
                document_count: stats.count,
                avg_document_size: stats.avg_obj_size,
                indexes: stats.nindexes,
                index_size: stats.total_index_size,
            })
        }))
        .await?;

        let history = match self.query_history(store, database, now).await {
            Ok(history) => history,
            Err(e) => {
                warn!("Storage history error: {}", e);
                Vec::new()
            }
        };

        Ok(StorageStats {
            status: true,
            database: database.to_string(),
            timestamp: timestamp_value(now),
            stats: UsageSummary {
                total_size: db_stats.data_size,
                storage_size: db_stats.storage_size,
                indexes: db_stats.indexes,
                total_index_size: db_stats.index_size,
                collections,
                avg_document_size: db_stats.avg_obj_size,
                free_space: db_stats.free_storage_size,
                scale_factor: db_stats.scale_factor.max(1),
            },
            history,
        })
    }

    async fn query_history(&self, store: &dyn DocumentStore, database: &str, now: DateTime<Utc>) -> DbResult<Vec<HistoryPoint>> {
        let since = now - Duration::days(self.settings.history_days);
        let ledger = store.collection(&self.settings.ledger_database, &self.settings.ledger_collection);
        let docs = ledger
            .find(&history_filter(database, since), FindOptions::sorted_by("timestamp", SortOrder::Ascending))
            .await?;
        docs.into_iter()
            .map(|doc| Ok(serde_json::from_value(Value::Object(doc)).map_err(StoreError::from)?))
            .collect()
    }

    /// Snapshot history for `database` within the window ending at `now`
    pub async fn history_at(&self, database: &str, now: DateTime<Utc>) -> DbResult<Vec<HistoryPoint>> {
        let store = self.open()?;
        let result = self.query_history(store.as_ref(), database, now).await;
        Self::close(store).await;
        result
    }

    pub async fn record_snapshot(&self, database: &str) -> bool {
        self.record_snapshot_at(database, Utc::now()).await
    }

    /// Append a snapshot taken at `now`; failures are logged and reported as false
    pub async fn record_snapshot_at(&self, database: &str, now: DateTime<Utc>) -> bool {
        let result = match self.open() {
            Ok(store) => {
                let result = self.append_snapshot(store.as_ref(), database, now).await;
                Self::close(store).await;
                result
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!("Recorded storage snapshot for {}", database);
                true
            }
            Err(e) => {
                error!("Record storage stats error: {}", e);
                false
            }
        }
    }

    async fn append_snapshot(&self, store: &dyn DocumentStore, database: &str, now: DateTime<Utc>) -> DbResult<()> {
        let stats = store.database_stats(database).await?;
        let snapshot = StorageSnapshot {
            database: database.to_string(),
            timestamp: timestamp_value(now),
            total_size: stats.data_size,
            storage_size: stats.storage_size,
            document_count: stats.objects,
            index_size: stats.index_size,
        };
        let doc = match serde_json::to_value(&snapshot).map_err(StoreError::from)? {
            Value::Object(doc) => doc,
            _ => return Err(DbError::InvalidPayload("snapshot must serialize to an object".to_string())),
        };
        store
            .collection(&self.settings.ledger_database, &self.settings.ledger_collection)
            .insert_one(doc)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_store::MemoryStore;
    use chrono::TimeZone;

    fn monitor_for(store: &MemoryStore) -> StorageMonitor {
        let store = store.clone();
        let connector = move |_: &str, _: &ConnectionOptions| -> Result<Arc<dyn DocumentStore>, StoreError> {
            Ok(Arc::new(store.clone()))
        };
        StorageMonitor::with_connector(ConnectionOptions::with_uri("memory://"), MonitorSettings::default(), Arc::new(connector))
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_history_window() {
        let store = MemoryStore::new();
        let monitor = monitor_for(&store);
        let now = fixed_now();

        // Recorded out of order to check the ascending sort
        for days_ago in [1, 31, 29] {
            assert!(monitor.record_snapshot_at("AppDB", now - Duration::days(days_ago)).await);
        }
        assert!(monitor.record_snapshot_at("OtherDB", now - Duration::days(2)).await);

        let history = monitor.history_at("AppDB", now).await.unwrap();
        let stamps: Vec<Value> = history.iter().map(|point| point.timestamp.clone()).collect();
        assert_eq!(
            stamps,
            vec![
                timestamp_value(now - Duration::days(29)),
                timestamp_value(now - Duration::days(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_stats_report_shape() {
        let store = MemoryStore::new();
        let users = store.collection("AppDB", "users");
        for i in 0..4 {
            users.insert_one(json!({"n": i}).as_object().cloned().unwrap()).await.unwrap();
        }
        store.collection("AppDB", "logs").insert_one(json!({"line": "x"}).as_object().cloned().unwrap()).await.unwrap();
        let monitor = monitor_for(&store);
        assert!(monitor.record_snapshot_at("AppDB", fixed_now() - Duration::days(3)).await);

        let report = monitor.get_stats_at("AppDB", fixed_now()).await;
        let value = serde_json::to_value(&report).unwrap();
        println!("report: {}", value);

        assert_eq!(value["status"], json!(true));
        assert_eq!(value["database"], json!("AppDB"));
        assert_eq!(value["stats"]["scaleFactor"], json!(1));
        let collections = value["stats"]["collections"].as_array().unwrap();
        assert_eq!(collections.len(), 2);
        let users = collections.iter().find(|c| c["name"] == json!("users")).unwrap();
        assert_eq!(users["documentCount"], json!(4));
        assert!(users["storageSize"].as_u64().unwrap() >= users["size"].as_u64().unwrap());
        assert_eq!(value["history"].as_array().unwrap().len(), 1);
        assert_eq!(value["history"][0]["documentCount"], json!(5));
    }

    #[tokio::test]
    async fn test_failures_are_structured() {
        let store = MemoryStore::new();
        let monitor = monitor_for(&store);

        store.fail_next_operations(1);
        let report = monitor.get_stats_at("AppDB", fixed_now()).await;
        assert!(!report.is_ok());
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], json!(false));
        assert_eq!(value["error"], json!("Failed to get storage statistics"));
        assert!(value["details"].as_str().unwrap().contains("injected"));

        store.fail_next_operations(1);
        assert!(!monitor.record_snapshot_at("AppDB", fixed_now()).await);

        let unconfigured = StorageMonitor::new(ConnectionOptions::default(), MonitorSettings::default());
        assert!(!unconfigured.record_snapshot("AppDB").await);
        assert!(!unconfigured.get_stats("AppDB").await.is_ok());
    }
}
