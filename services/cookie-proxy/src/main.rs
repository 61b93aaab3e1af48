//! Session Cookie Proxy
//!
//! Single-binary service that:
//! 1. Keeps one set of upstream session cookies fresh (scheduled, reactive
//!    and manual refreshes, never more than one at a time)
//! 2. Accepts API calls on `POST /proxy` and forwards them with the cookies
//!    attached
//! 3. Recovers from expired sessions by refreshing and retrying

mod admin;
mod config;
mod error;
mod history;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use acquirer::{CommandAcquirer, CommandSettings};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use session_refresh::{RefreshCoordinator, Refresher, Scheduler};
use session_store::CredentialStore;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::{Config, ServerConfig};
use crate::error::ApiError;
use crate::history::RequestHistory;
use crate::proxy::{ProxyClient, ProxyRequest, ProxyResponse};

/// Maximum time to wait for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: Arc<ProxyClient>,
    store: Arc<CredentialStore>,
    coordinator: RefreshCoordinator,
    scheduler: Arc<Scheduler>,
    history: Arc<RequestHistory>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit from `max_connections` covers admin routes too.
fn build_router(state: AppState, admin: AdminState, server: &ServerConfig) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/proxy", post(proxy_handler))
        .route("/refresh", post(refresh_handler))
        .with_state(state)
        .merge(admin::build_admin_router(admin));

    if server.enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any),
        );
    }

    router.layer(tower::limit::ConcurrencyLimitLayer::new(server.max_connections))
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

    // CLI: --config <path>, --refresh, --check
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());
    let refresh_only = args.iter().any(|a| a == "--refresh");
    let check_only = args.iter().any(|a| a == "--check");

    info!("starting session-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let config = Arc::new(config);

    info!(
        listen_addr = %config.server.listen_addr,
        credentials_path = %config.session.credentials_path.display(),
        acquirer = %config.acquirer.command,
        max_retries = config.proxy.max_retries,
        "configuration loaded"
    );

    let store = CredentialStore::load(
        config.session.credentials_path.clone(),
        config.session.required_cookie.clone(),
    )
    .await
    .context("failed to load session credentials")?;
    let store = Arc::new(store);

    match store.validity_report(Utc::now()).await {
        None => info!("stored session is valid"),
        Some(reason) => warn!(%reason, "no usable session, will acquire on first need"),
    }

    let acquirer = CommandAcquirer::new(CommandSettings {
        program: config.acquirer.command.clone(),
        args: config.acquirer.args.clone(),
        required_cookie: config.session.required_cookie.clone(),
        expiry_cookie: config.session.expiry_cookie.clone(),
        cookie_domain: config.session.cookie_domain.clone(),
        fallback_expiry: config.fallback_expiry()?,
    });
    let coordinator =
        RefreshCoordinator::new(store.clone(), Arc::new(acquirer), config.coordinator_settings());

    if check_only {
        print_check(&config, &store).await;
        return Ok(());
    }

    if refresh_only {
        coordinator
            .request_refresh()
            .await
            .context("credential refresh failed")?;
        info!("credential refresh succeeded");
        return Ok(());
    }

    let refresher: Arc<dyn Refresher> = Arc::new(coordinator.clone());
    let scheduler = Scheduler::new(
        refresher.clone(),
        store.clone(),
        config.schedule_window()?,
        config.tick(),
    );
    let proxy = ProxyClient::new(
        reqwest::Client::new(),
        store.clone(),
        refresher,
        config.retry_policy(),
        &config.session.origin,
    );

    let history = Arc::new(RequestHistory::default());
    let app_state = AppState {
        proxy: Arc::new(proxy),
        store: store.clone(),
        coordinator,
        scheduler: scheduler.clone(),
        history: history.clone(),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let admin_state = AdminState::new(history, config.clone());

    let app = build_router(app_state, admin_state, &config.server);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    scheduler.start().await;
    info!(addr = %listen_addr, "accepting requests");

    // Graceful shutdown: the drain timer starts at signal receipt, not at
    // server start, so the server is told to drain and then raced against it.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    scheduler.stop().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// `--check`: print the effective settings and session state, then exit.
async fn print_check(config: &Config, store: &CredentialStore) {
    let now = Utc::now();
    println!(
        "config: listen={} credentials={}",
        config.server.listen_addr,
        config.session.credentials_path.display()
    );
    println!(
        "schedule: maintenance={} preventive={} lead={}s tick={}s",
        config.schedule.maintenance_time,
        config.schedule.preventive_time,
        config.schedule.pre_expiry_lead_secs,
        config.schedule.tick_secs
    );
    println!(
        "proxy: max_retries={} retry_delay={}ms timeout={}s",
        config.proxy.max_retries, config.proxy.retry_delay_ms, config.proxy.request_timeout_secs
    );
    match store.validity_report(now).await {
        None => {
            let expires = store
                .get()
                .await
                .and_then(|s| s.expires_at)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            println!("session: valid until {expires}");
        }
        Some(reason) => println!("session: invalid ({reason})"),
    }
}

/// Liveness check.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    metrics::set_session_valid(state.store.is_valid(Utc::now()).await);
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Session, refresh and scheduler state.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let set = state.store.get().await;
    let invalid = state.store.validity_report(now).await;
    metrics::set_session_valid(invalid.is_none());

    let window = state.scheduler.window();
    Json(serde_json::json!({
        "service": "running",
        "tokenValid": invalid.is_none(),
        "invalidReason": invalid.map(|r| r.to_string()),
        "expiresAt": set.as_ref().and_then(|s| s.expires_at).map(|t| t.to_rfc3339()),
        "lastRefresh": set.as_ref().map(|s| s.acquired_at.to_rfc3339()),
        "lastFetch": state.history.last_success().await.map(|t| t.to_rfc3339()),
        "refreshState": state.coordinator.state_label().await,
        "lastRefreshResult": state.coordinator.last_refresh().await,
        "scheduler": {
            "running": state.scheduler.is_running().await,
            "lastCheck": state.scheduler.last_check().await.map(|t| t.to_rfc3339()),
            "maintenanceTime": window.maintenance.format("%H:%M").to_string(),
            "preventiveTime": window.preventive.format("%H:%M").to_string(),
            "preExpiryLeadSecs": window.lead_time.as_secs(),
        },
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Forward one API call upstream with the session cookies.
async fn proxy_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ProxyRequest>, JsonRejection>,
) -> std::result::Result<Json<ProxyResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    if request.url.trim().is_empty() {
        return Err(ApiError::InvalidRequest("url must not be empty".into()));
    }

    let response = state.proxy.execute(&request).await;

    for attempt in &response.attempts {
        debug!(
            attempt = attempt.number,
            method = %attempt.method,
            url = %attempt.url,
            status = attempt.status,
            outcome = attempt.outcome,
            duration_ms = attempt.duration.as_millis() as u64,
            "upstream attempt"
        );
        metrics::record_attempt(attempt);
    }
    let method = request
        .method
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or("GET")
        .to_ascii_uppercase();
    state
        .history
        .push(
            &method,
            &request.url,
            response.status_code,
            response.duration_ms,
            response.success,
            response.attempts.len() as u32,
        )
        .await;

    Ok(Json(response))
}

/// Manual refresh through the scheduler's coordinator.
async fn refresh_handler(
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    state.scheduler.trigger_refresh().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "session refreshed",
    })))
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
