//! AIS tracker service

use std::sync::Arc;
use std::time::Duration;

use ais_tracker::{
    api::{self, AppState},
    buffer::UpdateBuffer,
    config::AppConfig,
    database::{Database, MemoryStore, VesselStore},
    errors::AppError,
    reaper::StaleReaper,
    stats::{self, IngestStats},
    stream::StreamIngestor,
    writer::BatchWriter,
};
use tokio::sync::watch;
use tracing::{error, info};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    #[cfg(feature = "dotenvy")]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    config.validate()?;
    info!("Starting with {:?}", config);

    let store: Arc<dyn VesselStore> = if config.database.is_memory() {
        info!("Using in-memory vessel store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(Database::connect(&config.database).await?)
    };

    let buffer = UpdateBuffer::new(config.writer.high_water);
    let stats = IngestStats::new();

    let ingestor = StreamIngestor::new(config.stream.clone(), buffer.clone(), stats.clone());
    let ingest_state = ingestor.state();
    let writer = BatchWriter::new(store.clone(), buffer.clone(), config.writer.clone(), stats.clone());
    let reaper = StaleReaper::new(store.clone(), config.reaper.clone());
    let router = api::router(AppState::new(store.clone(), ingest_state));

    // Ingestion stops first so the writer's final flush sees every update
    let (stop_ingest, ingest_rx) = watch::channel(false);
    let (stop_rest, rest_rx) = watch::channel(false);

    let ingest_task = tokio::spawn(ingestor.run(ingest_rx));
    let writer_task = tokio::spawn(writer.run(rest_rx.clone()));
    let reaper_task = tokio::spawn(reaper.run(rest_rx.clone()));
    let stats_task = tokio::spawn(stats::log_periodically(
        stats.clone(),
        buffer.clone(),
        STATS_INTERVAL,
        rest_rx.clone(),
    ));
    let mut api_task = tokio::spawn(api::serve(router, config.api.bind, rest_rx));

    let api_exited = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            None
        }
        result = &mut api_task => {
            error!("HTTP API exited, shutting down");
            Some(result)
        }
    };

    let _ = stop_ingest.send(true);
    if let Err(e) = ingest_task.await {
        error!("Stream ingestor task failed: {}", e);
    }

    let _ = stop_rest.send(true);
    for (name, task) in [("writer", writer_task), ("reaper", reaper_task), ("stats", stats_task)] {
        if let Err(e) = task.await {
            error!("{} task failed: {}", name, e);
        }
    }
    let api_result = match api_exited {
        Some(result) => result,
        None => api_task.await,
    };

    stats.log(buffer.len());
    match api_result {
        Ok(result) => result?,
        Err(e) => error!("HTTP API task failed: {}", e),
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
