use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod api;
mod chunking;
mod config;
mod db;
mod embedding;
mod error;
mod processor;
mod service;
mod workflow;

use crate::config::StaticConfig;
use crate::db::Database;
use crate::service::ScriptoriumService;

// Re-export config crate types to avoid namespace collision
use ::config::{Config as ConfigBuilder, Environment, File};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!(
        "Starting scriptorium service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let static_config: StaticConfig = ConfigBuilder::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("SCRIPTORIUM")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    info!(
        host = %static_config.server.host,
        port = static_config.server.port,
        interval_secs = static_config.pipeline.processing_interval_secs,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&static_config.storage.data_dir)?;

    let db_path = static_config.storage.data_dir.join("scriptorium.db");
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    let config = Arc::new(static_config);
    let service = Arc::new(ScriptoriumService::new(db, config.clone()).await?);

    // Shutdown signal observed by the worker loop and the HTTP server
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    // Start the batch embedding worker (resumes any pending documents)
    ScriptoriumService::start_embedding_worker(service.clone(), shutdown.clone());

    let app = api::router(service, metrics_handle);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("scriptorium_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
