pub mod audit;
pub mod auth;
pub mod credentials;
pub mod gate;
pub mod handlers;
pub mod runner;
pub mod server;

use std::sync::Arc;

/// Shared application state threaded through axum handlers and middleware.
///
/// Everything in here is either immutable for the process lifetime or
/// internally synchronized, so cloning per request is cheap.
#[derive(Clone)]
pub struct AppState {
    pub credentials: Arc<credentials::Credentials>,
    pub validator: auth::SecurityValidator,
    pub runner: runner::CommandRunner,
    pub logs: audit::LogSink,
    /// Honour `X-Forwarded-For` when resolving the caller's address.
    pub trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(
        credentials: credentials::Credentials,
        runner: runner::CommandRunner,
        logs: audit::LogSink,
        replay_window: std::time::Duration,
    ) -> Self {
        let credentials = Arc::new(credentials);
        Self {
            validator: auth::SecurityValidator::new(credentials.clone(), replay_window),
            credentials,
            runner,
            logs,
            trust_forwarded_for: false,
        }
    }
}

pub use server::{build_router, run, ServerConfig};
