//! Gemini Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads a ring of Google API keys from the environment or a key file
//! 2. Exposes one endpoint per operation class
//! 3. Dispatches each request with credential rotation on rate limits and
//!    exponential backoff on transient failures
//! 4. Forwards to the Gemini `generateContent` API

mod config;
mod error;
mod gateway;
mod metrics;
mod upstream;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use dispatcher::Dispatcher;
use key_pool::CredentialPool;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::gateway::{BatchLimits, GatewayState, GatewayStats};
use crate::upstream::GeminiCaller;

/// How long in-flight requests may keep running after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long cancelled requests get to write their responses.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    gateway: GatewayState,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/operations/{operation}", post(operation_handler))
        .route("/v1/operations/{operation}/batch", post(batch_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn build_gateway_state(config: &Config) -> Result<GatewayState> {
    let keys = config.keys.iter().map(|k| k.expose().clone()).collect();
    let pool = CredentialPool::new(keys, config.pool_config())
        .context("failed to build credential pool")?;

    Ok(GatewayState {
        dispatcher: Dispatcher::new(Arc::new(pool)),
        caller: GeminiCaller::new(
            reqwest::Client::new(),
            &config.gateway.upstream_url,
            config.models.clone(),
        ),
        policy: config.retry_policy(),
        selection: config.credentials.selection,
        shutdown: CancellationToken::new(),
        draining: Arc::new(AtomicBool::new(false)),
        batch: BatchLimits {
            concurrency: config.gateway.batch_concurrency,
            max_items: config.gateway.max_batch_items,
        },
        stats: GatewayStats::new(),
    })
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gemini-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let gateway = build_gateway_state(&config)?;
    info!(
        listen_addr = %config.gateway.listen_addr,
        upstream_url = %config.gateway.upstream_url,
        credentials = gateway.dispatcher.pool().size(),
        selection = ?config.credentials.selection,
        max_retries = config.dispatch.max_retries,
        "configuration loaded"
    );

    let shutdown = gateway.shutdown.clone();
    let draining = gateway.draining.clone();
    let drain_notice = Duration::from_millis(config.gateway.drain_notice_ms);
    let in_flight = gateway.stats.in_flight.clone();
    let app = build_router(
        AppState {
            gateway,
            prometheus: prometheus_handle,
        },
        config.gateway.max_connections,
    );

    let listen_addr = config.gateway.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. /health answers 503 "draining" for drain_notice while still serving
    // 3. axum stops accepting connections and in-flight requests keep running
    // 4. at DRAIN_TIMEOUT the root token is cancelled, so pending attempts and
    //    backoffs end and their requests answer 503
    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();

    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = drain_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    draining.store(true, Ordering::Relaxed);
    info!(
        drain_notice_ms = drain_notice.as_millis() as u64,
        "reporting draining before closing the listener"
    );
    tokio::time::sleep(drain_notice).await;
    let _ = drain_tx.send(());

    let finished = match tokio::time::timeout(DRAIN_TIMEOUT, &mut server_handle).await {
        Ok(joined) => Some(joined),
        Err(_) => {
            warn!(
                remaining = in_flight.load(Ordering::Relaxed),
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, cancelling in-flight dispatches"
            );
            shutdown.cancel();
            tokio::time::timeout(CANCEL_GRACE, &mut server_handle)
                .await
                .ok()
        }
    };

    match finished {
        Some(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Some(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Some(Err(e)) => error!(error = %e, "server task panicked"),
        None => warn!(
            remaining = in_flight.load(Ordering::Relaxed),
            "forcing shutdown with requests still in flight"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: uptime, request counters and the pool usage snapshot.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = &state.gateway.stats;
    let draining = state.gateway.is_draining();
    let status_code = if draining {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };
    let body = serde_json::json!({
        "status": if draining { "draining" } else { "healthy" },
        "uptime_seconds": stats.started_at.elapsed().as_secs(),
        "requests_served": stats.requests_total.load(Ordering::Relaxed),
        "errors_total": stats.errors_total.load(Ordering::Relaxed),
        "retries_total": stats.retries_total.load(Ordering::Relaxed),
        "in_flight": stats.in_flight.load(Ordering::Relaxed),
        "pool": state.gateway.dispatcher.pool().usage(),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn operation_handler(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    body: Bytes,
) -> Response {
    gateway::handle_operation(&state.gateway, &operation, &body, new_request_id()).await
}

async fn batch_handler(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    body: Bytes,
) -> Response {
    gateway::handle_batch(&state.gateway, &operation, &body, new_request_id()).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
