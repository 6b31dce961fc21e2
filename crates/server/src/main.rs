mod auth;
mod config;
mod connection;
mod error;
mod fanout;
mod ingress;
mod lifecycle;
mod limiter;
mod router;
mod sanitize;
mod session;
mod validate;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::auth::JwtClaimsVerifier;
use crate::config::load_config;
use crate::fanout::FanoutRegistry;
use crate::lifecycle::ConnectionLifecycleManager;
use crate::limiter::ConnectionLimiter;
use crate::router::NullRouter;
use crate::session::SessionManager;
use crate::web::{AppState, Metrics};

fn parse_args() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("config.toml");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    config_path
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = parse_args();
    let config = load_config(&config_path)?;

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "configuration has {} issue(s); fix the ERROR(s) above and restart",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let jwt_secret = config.server.jwt_secret.clone().unwrap_or_else(|| {
        tracing::warn!(
            "no server.jwt_secret configured; generating an ephemeral secret for this process"
        );
        auth::generate_secret()
    });

    let limiter = Arc::new(ConnectionLimiter::new(config.limits.max_connections_per_user));
    let registry = Arc::new(FanoutRegistry::new());
    let metrics = Arc::new(Metrics::default());
    let session_manager = Arc::new(SessionManager::new(
        Duration::from_secs(config.session.reconnect_timeout_secs),
        Duration::from_secs(config.session.session_ttl_secs),
        Duration::from_secs(config.session.cleanup_interval_secs),
        config.session.max_response_times,
        config.session.max_session_name_len,
        Arc::clone(&metrics),
    ));
    session_manager.start_cleanup();

    let lifecycle = Arc::new(ConnectionLifecycleManager::new(
        Arc::clone(&limiter),
        Arc::clone(&registry),
        config.limits.clone(),
        config.heartbeat.clone(),
        config.limits.send_queue_capacity,
    ));
    lifecycle.set_allowed_origins(config.server.allowed_origins.clone());
    lifecycle.set_deprecate_jwt_query_param(config.server.deprecate_jwt_query_param);

    let state = Arc::new(AppState {
        config: config.clone(),
        lifecycle: Arc::clone(&lifecycle),
        claims_verifier: Arc::new(JwtClaimsVerifier::new(jwt_secret)),
        router: RwLock::new(Arc::new(NullRouter)),
        metrics: Arc::clone(&metrics),
        started_at: Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("invalid bind address")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("gatehouse listening on {bind_addr}");

    let shutdown_lifecycle = Arc::clone(&lifecycle);
    let shutdown_session_manager = Arc::clone(&session_manager);
    let grace_period = Duration::from_secs(config.server.shutdown_grace_period_secs);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("failed to install SIGTERM handler: {e}");
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, initiating graceful shutdown");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                }
            }
            if let Err(e) = shutdown_lifecycle.shutdown(grace_period).await {
                tracing::warn!("graceful shutdown deadline exceeded: {e}");
            }
            shutdown_session_manager.stop_cleanup().await;
        })
        .await
        .context("server error")?;

    tracing::info!("gatehouse shut down cleanly");
    Ok(())
}
