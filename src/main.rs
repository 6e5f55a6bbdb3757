mod broker;
mod classifier;
mod commands;
mod config;
mod db;
mod error;
mod fanout;
mod ingestion;
mod models;
mod relay;
mod rest_server;
mod retention;

use crate::config::Config;
use crate::relay::{handle_shutdown, TelemetryRelay};
use crate::rest_server::run_rest_server;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let relay = match TelemetryRelay::from_config(&config) {
        Ok(relay) => Arc::new(relay),
        Err(e) => {
            error!("Failed to initialize storage: {}", e);
            return;
        }
    };
    relay.start().await;

    // Start REST API server
    let rest_api_task = tokio::spawn(run_rest_server(relay.clone(), config));

    handle_shutdown().await;
    relay.shutdown().await;

    // Wait for tasks to complete
    let _ = tokio::join!(rest_api_task);
    info!("All services shut down successfully.");
}
