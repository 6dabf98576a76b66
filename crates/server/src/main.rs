mod api;
mod bootstrap;
mod health;
mod webhook;

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use accord_core::approvals::SyncService;
use accord_core::config::{AppConfig, LoadOptions};
use anyhow::Result;
use axum::Router;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bootstrap::Application;

fn init_logging(config: &AppConfig) {
    use accord_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

fn app_router(app: &Application) -> Router {
    let mut router = api::router(app.engine.clone())
        .merge(health::router(app.db_pool.clone(), app.engine.clone()));
    if let Some(callbacks) = &app.callbacks {
        router = router.merge(webhook::router(
            callbacks.clone(),
            app.sync.clone(),
            Duration::from_secs(app.config.engine.webhook_timeout_secs),
        ));
    }
    router
}

fn spawn_reconciler(sync: Arc<SyncService>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sync.reconcile_pending().await {
                Ok(summary) => info!(
                    event_name = "system.reconcile.completed",
                    examined = summary.examined,
                    applied = summary.applied,
                    unchanged = summary.unchanged,
                    failed = summary.failed,
                    "reconciliation sweep finished"
                ),
                Err(error) => warn!(
                    event_name = "system.reconcile.failed",
                    error = %error,
                    "reconciliation sweep failed"
                ),
            }
        }
    });
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let events = app.engine.subscribe();
    tokio::spawn(app.sync.clone().run(events));
    if app.config.engine.reconcile_interval_secs > 0 && app.callbacks.is_some() {
        spawn_reconciler(
            app.sync.clone(),
            Duration::from_secs(app.config.engine.reconcile_interval_secs),
        );
    }

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut server = tokio::spawn(
        axum::serve(listener, app_router(&app))
            .with_graceful_shutdown(async move {
                let _ = stop_rx.changed().await;
            })
            .into_future(),
    );
    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        webhook_enabled = app.callbacks.is_some(),
        "accord-server started"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal?,
        joined = &mut server => {
            joined??;
            return Ok(());
        }
    }

    info!(event_name = "system.server.stopping", correlation_id = "shutdown", "draining requests");
    let _ = stop_tx.send(true);
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => joined??,
        Err(_) => {
            warn!(
                event_name = "system.server.drain_timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "in-flight requests did not finish in time"
            );
            server.abort();
        }
    }

    app.db_pool.close().await;
    info!(
        event_name = "system.server.stopped",
        correlation_id = "shutdown",
        "accord-server stopped"
    );
    Ok(())
}
