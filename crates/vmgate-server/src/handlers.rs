use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use serde_json::json;

use crate::{
    audit::{AppStatus, AuditStatus},
    gate::ClientIp,
    runner::{is_safe_vm_name, Failure, Outcome, VmAction, VmCommandResult},
    AppState,
};

// ── Root & health ─────────────────────────────────────────────────────────────

pub async fn root() -> impl IntoResponse {
    Json(json!({
        "message": "VM Controller API is running",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Healthy when the VM tool answers a live listing.
pub async fn health(
    State(state): State<AppState>,
    Extension(client_ip): Extension<ClientIp>,
    method: Method,
    uri: Uri,
) -> Response {
    let result = state.runner.execute(VmAction::List, None).await;
    let ip = client_ip.to_string();
    if result.outcome == Outcome::Success {
        let vm_count = result.vm_names().len();
        state.logs.app(
            method.as_str(),
            uri.path(),
            &ip,
            AppStatus::Completed,
            &format!("healthy, {vm_count} VMs"),
        );
        Json(json!({
            "status": "healthy",
            "vm_count": vm_count,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .into_response()
    } else {
        let detail = format!("Service unhealthy: {}", result.details());
        tracing::error!(details = %result.details(), "health check failed");
        state
            .logs
            .app(method.as_str(), uri.path(), &ip, AppStatus::Error, &detail);
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "detail": detail,
            })),
        )
            .into_response()
    }
}

pub async fn not_found(
    State(state): State<AppState>,
    Extension(client_ip): Extension<ClientIp>,
    method: Method,
    uri: Uri,
) -> Response {
    state.logs.app(
        method.as_str(),
        uri.path(),
        &client_ip.to_string(),
        AppStatus::Error,
        "no such route",
    );
    (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response()
}

/// Method fallback for every known path.
pub async fn method_not_allowed(
    State(state): State<AppState>,
    Extension(client_ip): Extension<ClientIp>,
    method: Method,
    uri: Uri,
) -> Response {
    state.logs.app(
        method.as_str(),
        uri.path(),
        &client_ip.to_string(),
        AppStatus::Rejected,
        &format!("method {method} not allowed"),
    );
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({"error": "method not allowed"})),
    )
        .into_response()
}

// ── List ──────────────────────────────────────────────────────────────────────

pub async fn list_vms(
    State(state): State<AppState>,
    Extension(client_ip): Extension<ClientIp>,
    method: Method,
    uri: Uri,
) -> Response {
    let result = state.runner.execute(VmAction::List, None).await;
    let ip = client_ip.to_string();

    if result.outcome == Outcome::Success {
        let vms = result.vm_names();
        state.logs.app(
            method.as_str(),
            uri.path(),
            &ip,
            AppStatus::Completed,
            &format!("listed {} VMs", vms.len()),
        );
        Json(json!({ "vms": vms })).into_response()
    } else {
        state
            .logs
            .app(method.as_str(), uri.path(), &ip, AppStatus::Error, &result.details());
        respond(&result, state.runner.timeout())
    }
}

// ── Lifecycle actions ─────────────────────────────────────────────────────────

pub async fn start_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    method: Method,
    uri: Uri,
) -> Response {
    vm_action(state, VmAction::Start, name, client_ip, method, uri).await
}

pub async fn shutdown_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    method: Method,
    uri: Uri,
) -> Response {
    vm_action(state, VmAction::Shutdown, name, client_ip, method, uri).await
}

pub async fn restart_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(client_ip): Extension<ClientIp>,
    method: Method,
    uri: Uri,
) -> Response {
    vm_action(state, VmAction::Restart, name, client_ip, method, uri).await
}

/// Checks the VM exists, runs the action, and writes exactly one audit record
/// whatever the outcome.
async fn vm_action(
    state: AppState,
    action: VmAction,
    name: String,
    client_ip: ClientIp,
    method: Method,
    uri: Uri,
) -> Response {
    let result = if is_safe_vm_name(&name) {
        let listing = state.runner.execute(VmAction::List, None).await;
        match listing.outcome {
            Outcome::Success if listing.vm_names().iter().any(|vm| *vm == name) => {
                state.runner.execute(action, Some(name.clone())).await
            }
            Outcome::Success => VmCommandResult::not_found(action, &name),
            _ => VmCommandResult {
                action,
                vm_name: Some(name.clone()),
                ..listing
            },
        }
    } else {
        // The runner refuses the name without spawning anything.
        state.runner.execute(action, Some(name.clone())).await
    };

    let ip = client_ip.to_string();
    let details = result.details();
    let (audit_status, app_status) = if result.is_success() {
        (AuditStatus::Ok, AppStatus::Completed)
    } else {
        (AuditStatus::Error, AppStatus::Error)
    };
    state
        .logs
        .audit(action.as_str(), &name, &ip, audit_status, &details);
    state
        .logs
        .app(method.as_str(), uri.path(), &ip, app_status, &details);

    respond(&result, state.runner.timeout())
}

// ── Response mapping ──────────────────────────────────────────────────────────

/// The one place where command outcomes become HTTP responses.
pub fn respond(result: &VmCommandResult, timeout: Duration) -> Response {
    let vm = result.vm_name.as_deref().unwrap_or("");
    let output = || {
        let out = result.output();
        if out.is_empty() {
            result.action.default_output().to_owned()
        } else {
            out.to_owned()
        }
    };

    match (result.outcome, &result.failure) {
        (Outcome::Success, _) => Json(json!({
            "vm": vm,
            "action": result.action,
            "output": output(),
            "status": "success",
        }))
        .into_response(),
        (Outcome::AlreadyInState, _) => Json(json!({
            "vm": vm,
            "action": result.action,
            "output": output(),
            "status": "success",
            "already_in_state": true,
        }))
        .into_response(),
        (Outcome::NotFound, _) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("VM '{vm}' not found")})),
        )
            .into_response(),
        (Outcome::Timeout, _) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({
                "error": format!("command timed out after {}", humantime::format_duration(timeout))
            })),
        )
            .into_response(),
        (Outcome::ExecutionError, Some(Failure::UnsafeVmName)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid VM name"})),
        )
            .into_response(),
        (Outcome::ExecutionError, _) => {
            tracing::error!(action = %result.action, vm, details = %result.details(), "command failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "command failed", "detail": result.details()})),
            )
                .into_response()
        }
    }
}
