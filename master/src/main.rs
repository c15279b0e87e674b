mod coordination;
mod handlers;
mod monitor;
mod registry;
mod scheduler;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::config::{env_millis, env_secs, env_string};
use common::fs::LocalFileSystem;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::scheduler::{DefaultScheduler, TaskScheduler};
use crate::state::Coordinator;

struct Config {
    bind: String,
    dfs_root: String,
    schedule_interval: Duration,
    heartbeat_timeout: Duration,
    sweep_interval: Duration,
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind: env_string("MASTER_BIND", "0.0.0.0:8080"),
            dfs_root: env_string("DFS_ROOT", "/data/dfs"),
            schedule_interval: env_millis("SCHEDULE_INTERVAL_MS", 2_000),
            heartbeat_timeout: env_secs("WORKER_HEARTBEAT_TIMEOUT_SECS", 20),
            sweep_interval: env_secs("FAILOVER_SWEEP_INTERVAL_SECS", 5),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,tower_http=info,axum=info")),
        )
        .init();

    let config = Config::from_env();
    let fs = Arc::new(LocalFileSystem::new(&config.dfs_root));
    let coordinator = Arc::new(Coordinator::new(fs, config.heartbeat_timeout));
    let shutdown = CancellationToken::new();

    // heartbeat monitor in the background
    tokio::spawn(monitor::monitor_workers(
        coordinator.clone(),
        config.sweep_interval,
        shutdown.clone(),
    ));

    // periodic scheduling passes, never overlapping
    let scheduler: Arc<dyn TaskScheduler> = Arc::new(DefaultScheduler);
    let scheduling = tokio::spawn(scheduler::run_scheduler_loop(
        coordinator.clone(),
        scheduler,
        config.schedule_interval,
        shutdown.clone(),
    ));

    let app = handlers::build_router(coordinator).layer(TraceLayer::new_for_http());
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!("job server listening on {}", listener.local_addr()?);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    scheduling.await?;
    Ok(())
}
