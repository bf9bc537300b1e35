//! Wiring: backends from URLs, the module set, the server run loop.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;

use scanq_tasks::check::demo::{EchoModule, MultiplyModule};
use scanq_tasks::queue::memory::InMemoryQueue;
use scanq_tasks::queue::QueueConfig;
use scanq_tasks::store::memory::InMemoryBackend;
use scanq_tasks::store::generic::GenericTaskStore;
use scanq_tasks::store::StoreConfig;
use scanq_tasks::{JobQueue, JobService, ModuleRegistry, TaskStore};

use crate::config::ScanqConfig;
use crate::http;

/// Where a store or queue lives, parsed from its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendUrl {
    /// This process only.
    Memory,
    /// A Redis server shared by every process pointing at it.
    Redis(String),
}

impl BackendUrl {
    /// Parses `memory://` or a `redis://` / `rediss://` URL.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url == "memory" || url.starts_with("memory://") {
            Ok(Self::Memory)
        } else if url.starts_with("redis://") || url.starts_with("rediss://") {
            Ok(Self::Redis(url.to_string()))
        } else {
            bail!("unsupported backend url `{url}`, expected memory:// or redis://")
        }
    }
}

/// The modules this server can run.
pub fn module_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register(EchoModule)
        .register(MultiplyModule::default());
    registry
}

/// Opens the task store named by `url`.
pub async fn open_store(url: &str, config: StoreConfig) -> Result<Arc<dyn TaskStore>> {
    match BackendUrl::parse(url)? {
        BackendUrl::Memory => Ok(Arc::new(
            GenericTaskStore::new(InMemoryBackend::new()).with_config(config),
        )),
        BackendUrl::Redis(url) => open_redis_store(&url, config).await,
    }
}

/// Opens the job queue named by `url`.
pub async fn open_queue(url: &str, config: QueueConfig) -> Result<Arc<dyn JobQueue>> {
    match BackendUrl::parse(url)? {
        BackendUrl::Memory => Ok(Arc::new(InMemoryQueue::new(config))),
        BackendUrl::Redis(url) => open_redis_queue(&url, config).await,
    }
}

#[cfg(feature = "redis")]
async fn open_redis_store(url: &str, config: StoreConfig) -> Result<Arc<dyn TaskStore>> {
    let backend = scanq_tasks::store::redis::RedisBackend::new(url)
        .await
        .with_context(|| format!("connecting task store to {url}"))?;
    Ok(Arc::new(GenericTaskStore::new(backend).with_config(config)))
}

#[cfg(not(feature = "redis"))]
async fn open_redis_store(url: &str, _config: StoreConfig) -> Result<Arc<dyn TaskStore>> {
    bail!("store url `{url}` needs scanq built with the `redis` feature")
}

#[cfg(feature = "redis")]
async fn open_redis_queue(url: &str, config: QueueConfig) -> Result<Arc<dyn JobQueue>> {
    let queue = scanq_tasks::queue::redis::RedisQueue::new(url, config)
        .await
        .with_context(|| format!("connecting job queue to {url}"))?;
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "redis"))]
async fn open_redis_queue(url: &str, _config: QueueConfig) -> Result<Arc<dyn JobQueue>> {
    bail!("queue url `{url}` needs scanq built with the `redis` feature")
}

/// Builds the job service described by `config`.
pub async fn build_service(config: &ScanqConfig) -> Result<JobService> {
    let store_url = BackendUrl::parse(&config.store_url)?;
    let queue_url = BackendUrl::parse(&config.queue_url)?;
    if (store_url == BackendUrl::Memory) != (queue_url == BackendUrl::Memory) {
        tracing::warn!(
            store = %config.store_url,
            queue = %config.queue_url,
            "mixing an in-memory and a shared backend; tasks will not be visible across processes"
        );
    }

    let store = open_store(&config.store_url, config.store_config()).await?;
    let queue = open_queue(&config.queue_url, config.queue_config()).await?;
    Ok(JobService::new(store, queue, Arc::new(module_registry())))
}

/// Serves the API and runs the worker pool until Ctrl+C or SIGTERM.
pub async fn run(config: ScanqConfig) -> Result<()> {
    let service = build_service(&config).await?;
    let pool = (config.workers > 0).then(|| service.worker_pool(config.worker_config()).start());

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(
        %addr,
        workers = config.workers,
        store = %config.store_url,
        queue = %config.queue_url,
        "scanq listening"
    );

    axum::serve(listener, http::router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    tracing::info!("scanq stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown requested");
}
