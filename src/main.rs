//! Service entrypoint.
//!
//! Runs the fingerprint workers against the Postgres index and the S3 audio
//! bucket, and serves the lookup API until interrupted. On shutdown the
//! workers drain their current source before exiting.

use std::sync::Arc;

use aws_config::BehaviorVersion;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sonicgen::config::EngineConfig;
use sonicgen::index::postgres::PgIndex;
use sonicgen::index::FingerprintIndex;
use sonicgen::server::{self, AppState};
use sonicgen::store::{BlobStore, S3BlobStore};
use sonicgen::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(EngineConfig::load()?);

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| config.service.database_url.clone());
    let index: Arc<dyn FingerprintIndex> = Arc::new(PgIndex::connect(&database_url).await?);

    let aws_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let blobs: Arc<dyn BlobStore> = Arc::new(S3BlobStore::new(
        aws_sdk_s3::Client::new(&aws_config),
        config.service.s3_bucket.clone(),
    ));

    // fingerprint workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();
    for id in 0..config.service.workers {
        let worker = Worker {
            id,
            index: Arc::clone(&index),
            blobs: Arc::clone(&blobs),
            config: Arc::clone(&config),
        };
        workers.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }

    // lookup api
    let app = server::router(AppState {
        index: Arc::clone(&index),
        config: Arc::clone(&config),
    });
    let listener = tokio::net::TcpListener::bind(&config.service.bind_addr).await?;
    info!(addr = %config.service.bind_addr, workers = config.service.workers, "sonicgen up");
    let server_task = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining workers");
    shutdown_tx.send(true).ok();
    for handle in workers {
        handle.await.ok();
    }
    server_task.abort();

    Ok(())
}
