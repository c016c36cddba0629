//! depesche delivery service.
//!
//! Main entry point. Builds the store with its fallback, warms the
//! session pool, starts the delivery workers, and coordinates graceful
//! startup and shutdown.

use std::sync::Arc;

use anyhow::Result;
use depesche_core::{
    Clock, FallbackStore, KeyValueStore, MemoryStore, Metrics, RealClock, RedisStore,
};
use depesche_delivery::{Dispatcher, LogTransport, TaskQueue, Transport, WorkerPool};
use tracing::{info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting depesche delivery service");

    let config = Config::load()?;
    info!(
        store_url = %config.store_url_masked(),
        worker_count = config.worker_count,
        queue_capacity = config.queue_capacity,
        "configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let metrics = Arc::new(Metrics::new());

    // Startup health probe: a reachable durable store is preferred, an
    // unreachable one means beginning life in degraded mode.
    let primary: Option<Arc<dyn KeyValueStore>> =
        match RedisStore::connect(&config.store_url).await {
            Ok(store) => {
                info!("durable store reachable");
                Some(Arc::new(store))
            },
            Err(err) => {
                warn!(error = %err, "durable store unreachable, starting in fallback mode");
                None
            },
        };
    let store: Arc<dyn KeyValueStore> = Arc::new(FallbackStore::new(
        primary,
        MemoryStore::new(clock.clone()),
        metrics.clone(),
    ));

    let gateway = config.to_transport_config();
    info!(
        host = %gateway.host,
        port = gateway.port,
        tls = gateway.use_tls,
        "outbound gateway configured"
    );
    // The concrete gateway session implementation is linked by the
    // deployment; the logging transport stands in until then.
    let transport: Arc<dyn Transport> = Arc::new(LogTransport::new());

    let (queue, receiver) =
        TaskQueue::new(config.to_queue_config(), clock.clone(), metrics.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        transport,
        queue.clone(),
        config.to_dispatcher_config(),
        clock.clone(),
        metrics.clone(),
    ));

    let warmed = dispatcher.pool().warm_up(config.pool_warm_sessions).await;
    info!(warmed, "session pool ready");

    let mut workers =
        WorkerPool::new(dispatcher.clone(), queue, receiver, config.to_worker_config(), clock);
    workers.spawn_workers();

    info!("depesche is ready to dispatch");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    workers.shutdown_graceful().await?;
    dispatcher.pool().close_all().await;

    info!(
        sent = metrics.dispatch.sent.get(),
        failed = metrics.queue.failed.get(),
        "depesche shutdown complete"
    );
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,depesche=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received CTRL+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
