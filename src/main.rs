use actix_web::{web, App, HttpServer};
use log::{info, warn};
use std::path::Path;

use vornify_db::api;
use vornify_db::app_state::AppState;
use vornify_db::config::AppConfig;

fn init_logging(config: &AppConfig) {
    let log_config = &config.logging.config_file;
    if Path::new(log_config).exists() {
        if let Err(e) = log4rs::init_file(log_config, Default::default()) {
            eprintln!("Failed to initialize log4rs from {}: {}", log_config, e);
            env_logger::init();
        }
    } else {
        env_logger::init();
        warn!("Log config {} not found, logging to stderr", log_config);
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = AppConfig::load().map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    init_logging(&config);

    let state = AppState::from_config(config.clone());
    let server = &config.server;
    info!("Starting server on {}:{}", server.host, server.port);

    let max_payload_size = server.max_payload_size;
    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(web::Data::new(state.clone()))
            // Object payloads arrive base64 encoded inside JSON
            .app_data(web::JsonConfig::default().limit(max_payload_size))
            .configure(api::configure)
    })
    .workers(server.workers)
    .bind((server.host.as_str(), server.port))?
    .run()
    .await
}
