//! Operation Dispatcher
//!
//! Turns a request envelope into a typed `Command`, resolves the target
//! collection through the connection manager and runs the matching handler
//! under the dispatch retry policy. Every outcome leaves as a `Response`
//! envelope; no error escapes `execute`.

pub mod command;
pub mod records;


use chrono::Utc;
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::connection::ConnectionManager;
use crate::error::{DbError, DbResult, StoreError};
use crate::objects::{DeletionProgress, ObjectStore};
use crate::retry::RetryPolicy;
use crate::store::Collection;
use command::{Command, CommandKind};

/// Database used when a request names none
pub const DEFAULT_DATABASE: &str = "VortexDB";

/// Inbound envelope
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub database_name: Option<String>,
    #[serde(default)]
    pub collection_name: Option<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub data: Value,
}

/// Outbound envelope: `{success: true, data}` or `{success: false, error}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: &DbError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

fn to_data<T: Serialize>(value: T) -> DbResult<Value> {
    Ok(serde_json::to_value(value).map_err(StoreError::from)?)
}

pub struct Dispatcher {
    connection: Arc<ConnectionManager>,
    objects: ObjectStore,
    retry: RetryPolicy,
    default_database: String,
}

impl Dispatcher {
    pub fn new(connection: Arc<ConnectionManager>, objects: ObjectStore) -> Self {
        Self {
            connection,
            objects,
            retry: RetryPolicy::dispatch(),
            default_database: DEFAULT_DATABASE.to_string(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_database(mut self, database: impl Into<String>) -> Self {
        self.default_database = database.into();
        self
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub async fn execute(&self, request: Request) -> Response {
        match self.try_execute(request).await {
            Ok(data) => Response::ok(data),
            Err(e) => {
                error!("Execute operation error: {}", e);
                Response::failure(&e)
            }
        }
    }

    /// Adapter for callers holding raw JSON
    pub async fn execute_json(&self, request: Value) -> Value {
        let response = match serde_json::from_value::<Request>(request) {
            Ok(request) => self.execute(request).await,
            Err(e) => Response::failure(&DbError::InvalidPayload(format!("malformed request: {}", e))),
        };
        serde_json::to_value(&response).unwrap_or(Value::Null)
    }

    async fn try_execute(&self, request: Request) -> DbResult<Value> {
        let collection_name = request
            .collection_name
            .filter(|name| !name.is_empty())
            .ok_or(DbError::MissingCollection)?;
        let database = request
            .database_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.default_database.clone());
        let kind: CommandKind = request.command.parse()?;
        let command = Command::parse(kind, request.data, Utc::now())?;

        let collection = self.connection.get_collection(&database, &collection_name).await?;
        info!("Executing {} on {}.{}", kind, database, collection_name);

        let command = &command;
        let collection = collection.as_ref();
        let progress = &DeletionProgress::new();
        self.retry
            .run(kind.as_str(), move || self.handle(command, collection, progress))
            .await
    }

    async fn handle(&self, command: &Command, collection: &dyn Collection, progress: &DeletionProgress) -> DbResult<Value> {
        match command {
            Command::Create(payload) => to_data(records::create(collection, payload).await?),
            Command::Read(query) => to_data(records::read(collection, query).await?),
            Command::Update(fields) => to_data(records::update(collection, fields).await?),
            Command::Delete(filter) => to_data(records::delete(collection, filter).await?),
            Command::Verify(filter) => to_data(records::verify(collection, filter).await?),
            Command::Append { existing, append } => to_data(records::append(collection, existing, append).await?),
            Command::UpdateField { existing, field, value } => {
                to_data(records::update_field(collection, existing, field, value).await?)
            }
            Command::DeleteField { existing, field } => {
                to_data(records::delete_field(collection, existing, field).await?)
            }
            Command::CreateObject(object) => to_data(self.objects.create(collection, object).await?),
            Command::DeleteObject { id } => to_data(self.objects.delete(collection, id, progress).await?),
            Command::GetObject { id } => to_data(self.objects.get(collection, id).await?),
        }
    }
}
