//! Worker process entry point.
//!
//! Wires the environment-driven settings into a polling worker: broker
//! queue when a broker endpoint is configured, in-memory queue otherwise
//! (single-node mode). Conversion operations are registered by the
//! deployment; this binary starts with an empty registry and is extended
//! where operations are linked in.

use std::sync::Arc;
use std::time::Duration;

use datapack_core::{init_logging, ExportLayout, InMemoryLockCache, LogFormat, Settings};
use datapack_flow::dispatch::broker::{BrokerConfig, BrokerStepQueue};
use datapack_flow::dispatch::memory::InMemoryStepQueue;
use datapack_flow::dispatch::StepQueue;
use datapack_flow::finalize::RunFinalizer;
use datapack_flow::notify::LogNotifier;
use datapack_flow::operation::OperationRegistry;
use datapack_flow::store::memory::InMemoryStore;
use datapack_flow::worker::{Worker, WorkerTick};

/// Delay between polls of an empty queue.
const IDLE_POLL_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::Pretty);
    let settings = Settings::from_env()?;
    let layout = ExportLayout::new(
        settings.staging_root.clone(),
        settings.download_root.clone(),
    );

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "datapack-worker".to_string());
    let queue_name = format!("datapack.{hostname}");

    let queue: Arc<dyn StepQueue> = match &settings.broker_api_url {
        Some(api_url) => Arc::new(BrokerStepQueue::new(BrokerConfig::new(
            api_url,
            "/",
            queue_name.clone(),
        ))?),
        None => Arc::new(InMemoryStepQueue::new(queue_name.clone())),
    };

    let store = Arc::new(InMemoryStore::new());
    let locks = Arc::new(InMemoryLockCache::new());
    let registry = Arc::new(OperationRegistry::new());
    let finalizer = RunFinalizer::new(layout.clone(), Arc::new(LogNotifier));

    let worker = Worker::new(
        hostname.clone(),
        store,
        queue,
        locks,
        registry,
        layout,
        finalizer,
    )
    .with_lock_ttl(settings.lock_ttl);

    tracing::info!(host = %hostname, queue = %queue_name, "worker started");
    loop {
        match worker.poll_once().await {
            Ok(WorkerTick::Idle) => tokio::time::sleep(IDLE_POLL_DELAY).await,
            Ok(tick) => tracing::debug!(?tick, "handled dispatch"),
            Err(e) => {
                tracing::error!(error = %e, "poll failed");
                tokio::time::sleep(IDLE_POLL_DELAY).await;
            }
        }
    }
}
