use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::{
    audit::AppStatus,
    auth::{API_KEY_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER},
    AppState,
};

/// Caller address as resolved by [`access_gate`], attached to every request
/// that passes it. `None` when the transport exposes no peer address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientIp(pub Option<IpAddr>);

impl fmt::Display for ClientIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ip) => write!(f, "{ip}"),
            None => f.write_str("unknown"),
        }
    }
}

/// Peer address from the connection. `X-Forwarded-For` is consulted only when
/// the operator has said the service sits behind a trusted proxy.
pub fn resolve_client_ip(
    peer: Option<SocketAddr>,
    headers: &HeaderMap,
    trust_forwarded_for: bool,
) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return Some(ip.to_canonical());
        }
    }
    peer.map(|addr| addr.ip().to_canonical())
}

/// Presence-only view of the authentication headers, safe to log.
pub fn redacted_headers(headers: &HeaderMap) -> String {
    let presence = |name: &str| {
        if headers.contains_key(name) {
            "present"
        } else {
            "absent"
        }
    };
    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("absent");
    format!(
        "api_key={} signature={} timestamp={}",
        presence(API_KEY_HEADER),
        presence(SIGNATURE_HEADER),
        timestamp
    )
}

/// Outermost middleware: runs for every request before routing.
///
/// Logs the arrival, then refuses callers outside the allow-list before any
/// authentication work is done.
pub async fn access_gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = resolve_client_ip(peer, request.headers(), state.trust_forwarded_for);
    let client_ip = ClientIp(ip);

    let method = request.method().to_string();
    let path = request.uri().path().to_owned();
    state.logs.app(
        &method,
        &path,
        &client_ip.to_string(),
        AppStatus::Received,
        &redacted_headers(request.headers()),
    );

    let allow_list = state.credentials.allow_list();
    let permitted = match ip {
        Some(ip) => allow_list.permits(ip),
        None => allow_list.is_empty(),
    };
    if !permitted {
        warn!(%client_ip, %path, "request from address outside allow-list");
        state.logs.app(
            &method,
            &path,
            &client_ip.to_string(),
            AppStatus::Rejected,
            &format!("IP {client_ip} not in whitelist"),
        );
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Forbidden: IP address not allowed"})),
        )
            .into_response();
    }

    request.extensions_mut().insert(client_ip);
    next.run(request).await
}
