use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    audit::LogSink,
    auth::{require_signed_request, DEFAULT_REPLAY_WINDOW},
    credentials::Credentials,
    gate::access_gate,
    handlers::{
        health, list_vms, method_not_allowed, not_found, restart_vm, root, shutdown_vm, start_vm,
    },
    runner::{CommandRunner, HyperV, Outcome, VmAction, DEFAULT_COMMAND_TIMEOUT},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub log_dir: PathBuf,
    pub command_timeout: Duration,
    pub replay_window: Duration,
    pub trust_forwarded_for: bool,
    /// PowerShell executable used to drive Hyper-V.
    pub powershell: String,
}

impl ServerConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            credentials,
            log_dir: PathBuf::from("logs"),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            replay_window: DEFAULT_REPLAY_WINDOW,
            trust_forwarded_for: false,
            powershell: "powershell".into(),
        }
    }
}

/// Statically composed request pipeline:
///
/// access gate → router → signature check (VM routes only) → handler.
pub fn build_router(state: AppState) -> Router {
    // Allow-list only.
    let public = Router::new()
        .route("/", get(root).fallback(method_not_allowed))
        .route("/health", get(health).fallback(method_not_allowed));

    // Allow-list + API key + HMAC.
    let protected = Router::new()
        .route("/vm/list", get(list_vms).fallback(method_not_allowed))
        .route("/vm/{name}/start", post(start_vm).fallback(method_not_allowed))
        .route("/vm/{name}/shutdown", post(shutdown_vm).fallback(method_not_allowed))
        .route("/vm/{name}/restart", post(restart_vm).fallback(method_not_allowed))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_signed_request,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), access_gate))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let allow_list = cfg.credentials.allow_list().to_string();
    info!(
        api_key = "set",
        hmac_secret = if cfg.credentials.hmac_secret().is_some() { "set" } else { "disabled" },
        allow_ip = %allow_list,
        log_dir = %cfg.log_dir.display(),
        command_timeout = ?cfg.command_timeout,
        replay_window = ?cfg.replay_window,
        trust_forwarded_for = cfg.trust_forwarded_for,
        "configuration loaded"
    );

    let runner = CommandRunner::new(HyperV::new(cfg.powershell), cfg.command_timeout);
    probe_vm_tool(&runner).await;

    let logs = LogSink::new(cfg.log_dir);
    let mut state = AppState::new(cfg.credentials, runner, logs, cfg.replay_window);
    state.trust_forwarded_for = cfg.trust_forwarded_for;

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "vmgate server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")
}

/// One listing at startup so a missing or unauthorized tool shows up in the
/// log immediately. Failure is not fatal.
async fn probe_vm_tool(runner: &CommandRunner) {
    let result = runner.execute(VmAction::List, None).await;
    if result.outcome == Outcome::Success {
        info!(vm_count = result.vm_names().len(), "VM tool reachable");
    } else {
        warn!(details = %result.details(), "VM tool probe failed; continuing startup");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
