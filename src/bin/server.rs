//! Dispatch server entry point: loads configuration, connects to Postgres,
//! wires the kernel components, spawns one worker per node, and serves the
//! HTTP API until an interrupt signal is received.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use dispatch_core::config::Config;
use dispatch_core::kernel::jobs::{CodeVetter, PostgresJobStore, QueueManager, RemoteExecutor, WorkerPool};
use dispatch_core::kernel::{Limiter, PostgresTokenStore};
use dispatch_core::server::{build_app, AppState};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dispatch_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true))
        .init();

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    tracing::info!(nodes = config.node_count(), "starting dispatch server");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("running database migrations");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let tokens = Arc::new(PostgresTokenStore::new(pool.clone()));
    let jobs = Arc::new(PostgresJobStore::new(pool.clone()));
    let limiter = Arc::new(Limiter::new());
    let vetter = Arc::new(CodeVetter::new(config.vetter.clone()));
    let queue = Arc::new(QueueManager::new(config.node_count()));

    let executors: Vec<Arc<RemoteExecutor>> = config
        .nodes
        .iter()
        .map(|node| {
            Arc::new(RemoteExecutor::new(
                node.node_id,
                node.ip.clone(),
                config.ssh.clone(),
                config.remote_paths.clone(),
            ))
        })
        .collect();

    let worker_pool = WorkerPool::spawn(executors.clone(), queue.clone(), jobs.clone(), config.clone());

    let state = AppState {
        config: config.clone(),
        tokens,
        limiter,
        vetter,
        queue,
        jobs,
        executors: Arc::new(executors),
    };

    let app = build_app(state);
    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind listener")?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    worker_pool.abort_all();
    Ok(())
}

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining");
}
