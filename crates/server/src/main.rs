use std::{net::SocketAddr, sync::Arc, time::Duration};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bimtrack_server::{
    app,
    config::Config,
    db::Database,
    services::{
        ingestion::{IngestQueue, IngestWorker, PlaceholderParser},
        storage::LocalBlobStore,
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bimtrack_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    // Initialize database
    let db = Database::connect(&config.database_url, config.database_max_connections).await?;
    db.run_migrations().await?;

    let blobs = LocalBlobStore::new(&config.storage_path, config.upload_url_ttl_secs);
    blobs.init().await?;
    let blobs = Arc::new(blobs);

    // Start the ingestion worker
    let ingest = IngestQueue::new(config.ingest.max_attempts);
    let parser = PlaceholderParser::new(Duration::from_millis(config.ingest.simulated_delay_ms));
    let worker = IngestWorker::new(
        db.clone(),
        blobs.clone(),
        Arc::new(parser),
        config.ingest.clone(),
        &ingest,
    )
    .start();

    let state = AppState {
        db,
        config: config.clone(),
        blobs,
        ingest,
    };

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = worker.shutdown().await {
        tracing::warn!(error = %e, "Ingestion worker already stopped");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
}
