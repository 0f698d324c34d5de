mod adapters;
mod api;
mod config;
mod db;
mod error;
mod funnel;
mod inventory;
mod jobs;
mod models;
mod parser;
mod poller;
mod security;
#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    adapters::{GmpEngine, NmapAdapter, NucleiAdapter},
    api::{health, list_tasks, online_hosts, trigger_deep_scan, trigger_triage},
    config::AppConfig,
    inventory::Inventory,
    jobs::{Orchestrator, RateLimiter, Scheduler},
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub config: Arc<AppConfig>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(AppConfig::load()?);

    let pool = db::create_pool(&config.database_url)
        .await
        .context("failed to open inventory database")?;
    db::run_migrations(&pool)
        .await
        .context("failed to apply migrations")?;

    if let Err(e) = config.discovery.target() {
        warn!(error = %e, "discovery disabled until a target range is configured");
    }
    if let Err(e) = config.deep_scan.credentials() {
        warn!(error = %e, "deep scanning disabled until credentials are configured");
    }

    let orchestrator = Orchestrator::new(
        Inventory::new(pool),
        Arc::new(NmapAdapter::new(config.discovery.clone())),
        Arc::new(NucleiAdapter::new(config.triage.clone())),
        Arc::new(GmpEngine::from_config(config.deep_scan.clone())),
        Arc::clone(&config),
    );

    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::from_config(&config.schedule);
    let scheduler_task = tokio::spawn(scheduler.run(Arc::new(orchestrator.clone()), shutdown.clone()));

    let state = AppState {
        orchestrator,
        config: Arc::clone(&config),
        rate_limiter: Arc::new(Mutex::new(RateLimiter::new(config.manual_runs_per_minute))),
    };

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/hosts/online", get(online_hosts))
        .route("/api/tasks", get(list_tasks))
        .route("/api/scan/triage/{target}", post(trigger_triage))
        .route("/api/scan/deep/{ip}", post(trigger_deep_scan))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "scanfunnel listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not install ctrl-c handler");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    scheduler_task.await.context("scheduler task panicked")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
