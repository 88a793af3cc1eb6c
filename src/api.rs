//! HTTP boundary
//!
//! Thin actix-web handlers that hand request bodies to the dispatcher and
//! the storage monitor and return their envelopes as JSON. Outcomes are
//! reported in the body, so these always answer 200 except for a storage
//! request without a database name.

use actix_web::{web, HttpResponse, Responder};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;

#[derive(Debug, Deserialize)]
pub struct StorageRequest {
    #[serde(default)]
    pub database_name: Option<String>,
}

fn mdc_context(body: &Value) {
    log_mdc::clear();
    if let Some(database) = body.get("database_name").and_then(Value::as_str) {
        log_mdc::insert("database", database);
    }
    if let Some(collection) = body.get("collection_name").and_then(Value::as_str) {
        log_mdc::insert("collection", collection);
    }
}

fn database_name(request: &StorageRequest) -> Option<&str> {
    request.database_name.as_deref().filter(|name| !name.is_empty())
}

fn missing_database() -> HttpResponse {
    warn!("Storage request without database_name");
    HttpResponse::BadRequest().json(json!({
        "status": false,
        "error": "Database name is required"
    }))
}

/// POST /api/vornifydb
pub async fn vornifydb(body: web::Json<Value>, app_state: web::Data<AppState>) -> impl Responder {
    let body = body.into_inner();
    mdc_context(&body);
    let response = app_state.dispatcher.execute_json(body).await;
    HttpResponse::Ok().json(response)
}

/// POST /api/storage
pub async fn storage_stats(body: web::Json<StorageRequest>, app_state: web::Data<AppState>) -> HttpResponse {
    let Some(database) = database_name(&body) else {
        return missing_database();
    };
    log_mdc::insert("database", database);
    info!("Storage stats requested for {}", database);
    HttpResponse::Ok().json(app_state.monitor.get_stats(database).await)
}

/// POST /api/storage/snapshot
pub async fn storage_snapshot(body: web::Json<StorageRequest>, app_state: web::Data<AppState>) -> HttpResponse {
    let Some(database) = database_name(&body) else {
        return missing_database();
    };
    log_mdc::insert("database", database);
    let recorded = app_state.monitor.record_snapshot(database).await;
    HttpResponse::Ok().json(json!({ "status": recorded }))
}

/// Register every route of the API
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/vornifydb", web::post().to(vornifydb))
        .route("/api/storage", web::post().to(storage_stats))
        .route("/api/storage/snapshot", web::post().to(storage_snapshot));
}
