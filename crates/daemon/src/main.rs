//! Pipeq - Load runner entry point
//! Opens a queue on SQLite and runs pushers/poppers against it until Ctrl+C

mod config;
mod shutdown;
mod workload;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pipeq_core::application::{PipeLocker, PipeQueue};
use pipeq_core::port::id_provider::TimeOrderedIdProvider;
use pipeq_core::port::time_provider::SystemTimeProvider;
use pipeq_infra_sqlite::{create_pool, run_migrations, SqliteQueueRepository};

use config::DaemonConfig;
use shutdown::shutdown_channel;
use workload::{run_popper, run_pusher, RunCounters};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Time allowed for runner tasks to drain after Ctrl+C (5s)
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize logging
    let log_format = std::env::var("PIPEQ_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("pipeq=info"))?;

    match log_format.as_str() {
        "json" => {
            // Production: JSON structured logging
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            // Development: Pretty formatting with colors
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    info!("Pipeq v{} starting...", VERSION);

    // 2. Load configuration
    let config = DaemonConfig::from_env()?;
    info!(
        db_path = %config.db_path,
        queue = %config.queue.name,
        pushers = config.pushers,
        poppers = config.poppers,
        "Configuration loaded"
    );

    // 3. Initialize database
    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let pool = create_pool(&config.db_path)
        .await
        .map_err(|e| anyhow::anyhow!("DB pool creation failed: {}", e))?;
    run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;

    // 4. Setup dependencies (DI wiring)
    let repo = Arc::new(SqliteQueueRepository::new(pool.clone()));
    let queue = PipeQueue::open(
        repo,
        Arc::new(PipeLocker::new()),
        Arc::new(TimeOrderedIdProvider),
        Arc::new(SystemTimeProvider),
        config.queue.clone(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Opening queue failed: {}", e))?;
    info!(descriptor = ?queue.descriptor(), "Queue opened");

    // 5. Start runner tasks
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let counters = Arc::new(RunCounters::default());
    let idle = Duration::from_millis(queue.descriptor().pop_pipe_refresh_delay_ms as u64);

    let mut handles = Vec::new();
    for id in 0..config.pushers {
        handles.push(tokio::spawn(run_pusher(
            id,
            queue.create_pusher(),
            config.payload_bytes,
            config.push_interval,
            Arc::clone(&counters),
            shutdown_rx.clone(),
        )));
    }
    for id in 0..config.poppers {
        handles.push(tokio::spawn(run_popper(
            id,
            queue.create_popper(),
            idle,
            Arc::clone(&counters),
            shutdown_rx.clone(),
        )));
    }

    // 6. Periodic stats report
    let stats_handle = {
        let queue = queue.clone();
        let counters = Arc::clone(&counters);
        let mut shutdown = shutdown_rx.clone();
        let every = config.stats_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let push = queue.push_stats();
                        let pop = queue.pop_stats();
                        info!(
                            pushed = counters.pushed(),
                            popped = counters.popped(),
                            rolled_back = counters.rolled_back(),
                            errors = counters.errors(),
                            push_avg_ms = push.average,
                            pop_avg_ms = pop.average,
                            "Queue stats"
                        );
                    }
                    _ = shutdown.wait() => break,
                }
            }
        })
    };

    info!("System ready. Press Ctrl+C to shutdown");

    // 7. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Draining pushers and poppers...");

    // 8. Graceful shutdown
    shutdown_tx.shutdown();
    for handle in handles {
        match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Runner task failed"),
            Err(_) => warn!("Runner task did not stop within grace period"),
        }
    }
    let _ = stats_handle.await;
    pool.close().await;

    info!(
        pushed = counters.pushed(),
        popped = counters.popped(),
        "Shutdown complete."
    );

    Ok(())
}
