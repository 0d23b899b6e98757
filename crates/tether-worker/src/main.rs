//! Tether worker binary.

use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tether_models::MessageBody;
use tether_queue::{MessageQueue, QueueConfig, RedisStreamQueue};
use tether_storage::{BlobStore, InMemoryBlobStore, S3BlobStore, S3Config};
use tether_store::{
    RedisAuditLog, RedisBackend, RedisInstanceStore, RedisJobStore, RedisLedger, RedisSequenceStore, StoreConfig,
};
use tether_worker::orchestrator::ArchiveWorkflow;
use tether_worker::{
    Consumer, ControlHandler, ControlPlane, Engine, EngineConfig, HandlerRouter, SequencedHandler,
    StartJobHandler, UnitProgressHandler, WorkerConfig, WorkflowRegistry,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize tracing: {:#}", e);
        std::process::exit(1);
    }

    info!("Starting tether-worker");

    if let Err(e) = run().await {
        error!("Worker error: {:#}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

fn init_tracing() -> anyhow::Result<()> {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("tether=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    if let Ok(port) = std::env::var("METRICS_PORT") {
        let port: u16 = port.parse().context("METRICS_PORT must be a port number")?;
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(port, "Serving metrics");
    }

    let worker_config = WorkerConfig::from_env();
    let engine_config = EngineConfig::from_env();
    let store_config = StoreConfig::from_env();
    info!("Worker config: {:?}", worker_config);
    worker_config.check_ledger_retention(store_config.ledger_retention);

    let backend = RedisBackend::from_config(&store_config).context("Failed to create Redis store")?;
    backend.ping().await.context("Redis is unreachable")?;
    let ledger = Arc::new(RedisLedger::new(backend.clone(), &store_config));
    let jobs = Arc::new(RedisJobStore::new(backend.clone()));
    let instances = Arc::new(RedisInstanceStore::new(backend.clone()));
    let sequences = Arc::new(RedisSequenceStore::new(backend.clone()));
    let audit = Arc::new(RedisAuditLog::new(backend, store_config.audit_max_len));

    let blobs: Arc<dyn BlobStore> = if S3Config::is_configured() {
        Arc::new(S3BlobStore::from_env().context("Failed to configure blob storage")?)
    } else {
        warn!("BLOB_ENDPOINT_URL not set, keeping blobs in memory");
        Arc::new(InMemoryBlobStore::new())
    };

    let queue = RedisStreamQueue::new(QueueConfig::from_env()).context("Failed to create queue")?;
    queue.init().await.context("Failed to initialize queue")?;
    let queue: Arc<dyn MessageQueue> = Arc::new(queue);

    let registry = WorkflowRegistry::new().register(Arc::new(ArchiveWorkflow::default()));
    let engine = Arc::new(Engine::new(
        engine_config,
        registry,
        jobs.clone(),
        instances.clone(),
        ledger.clone(),
        blobs.clone(),
    ));
    let recovered = engine.recover().await.context("Failed to recover instances")?;
    info!(recovered, "Engine ready");

    let control = Arc::new(ControlPlane::new(jobs.clone(), instances, engine.clone(), audit));
    let router = HandlerRouter::new()
        .route(MessageBody::START_JOB, Arc::new(StartJobHandler::new(jobs.clone(), engine.clone())))
        .route(MessageBody::CONTROL_JOB, Arc::new(ControlHandler::new(control)))
        .route(
            MessageBody::PROCESS_UNIT,
            Arc::new(SequencedHandler::new(UnitProgressHandler::new(jobs.clone()), sequences)),
        );
    info!(message_types = ?router.message_types(), "Routes registered");

    let consumer = Arc::new(Consumer::new(
        worker_config,
        queue,
        ledger,
        jobs,
        blobs,
        Arc::new(router),
    ));

    let signal_consumer = consumer.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_consumer.shutdown();
    });

    consumer.run().await?;
    Ok(())
}
