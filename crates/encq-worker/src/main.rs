//! Encoding worker binary.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use encq_broker::QueueBroker;
use encq_media::MediaEncoder;
use encq_registry::{Dispatcher, JobStore, RedisJobStore};
use encq_storage::{BlobStore, S3BlobStore};
use encq_worker::{
    spawn_dead_letter_reaper, ClusterStatusAggregator, Worker, WorkerConfig, WorkerDirectory,
};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("encq=info".parse().expect("static directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting encq-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let store: Arc<dyn JobStore> = match RedisJobStore::from_env() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to create job store: {}", e);
            std::process::exit(1);
        }
    };

    let blobs = match S3BlobStore::from_env() {
        Ok(blobs) => blobs,
        Err(e) => {
            error!("Failed to create blob store: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = blobs.ensure_bucket().await {
        error!("Failed to ensure bucket: {}", e);
        std::process::exit(1);
    }
    let blobs: Arc<dyn BlobStore> = Arc::new(blobs);

    let encoder = match MediaEncoder::from_env() {
        Ok(encoder) => Arc::new(encoder),
        Err(e) => {
            error!("Failed to create encoder: {}", e);
            std::process::exit(1);
        }
    };

    let broker = Arc::new(QueueBroker::from_env());
    let sweeper = broker.spawn_lease_sweeper();
    let reaper = spawn_dead_letter_reaper(&broker, Arc::clone(&store));

    // Re-enqueue jobs that were Pending when the previous process died.
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&broker));
    match dispatcher.recover().await {
        Ok(0) => {}
        Ok(count) => info!("Recovered {} pending jobs", count),
        Err(e) => warn!("Startup recovery failed: {}", e),
    }

    let directory = Arc::new(WorkerDirectory::new(config.heartbeat_grace));
    let aggregator = ClusterStatusAggregator::new(Arc::clone(&directory));

    let worker = Worker::new(
        config,
        Arc::clone(&broker),
        store,
        blobs,
        encoder,
        directory,
    );

    // One pool snapshot shortly after startup, so operators can see the
    // worker registered and idle.
    let snapshot_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = aggregator.snapshot(Duration::from_millis(500)).await;
        info!(
            worker_count = status.worker_count,
            all_available = status.all_available,
            "Cluster status"
        );
    });

    // Shutdown on ctrl-c
    let shutdown_worker = Arc::clone(&worker);
    let shutdown_broker = Arc::clone(&broker);
    let signal_task = tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_worker.shutdown();
        shutdown_broker.shutdown();
    });

    if let Err(e) = worker.run().await {
        error!("Worker error: {}", e);
        std::process::exit(1);
    }

    broker.shutdown();
    snapshot_task.abort();
    signal_task.abort();
    sweeper.abort();
    if let Some(reaper) = reaper {
        reaper.abort();
    }

    info!("Worker shutdown complete");
}
