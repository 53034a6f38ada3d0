//! Shared application state for the HTTP layer.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName};
use tokio::sync::watch;

use crate::gateway::Gateway;

/// Header the trusted reverse proxy sets to the authenticated user.
pub const DEFAULT_IDENTITY_HEADER: &str = "x-authenticated-user";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub identity_header: HeaderName,
    closing: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, identity_header: HeaderName) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            gateway,
            identity_header,
            closing: Arc::new(closing),
        }
    }

    /// The caller identity, if the proxy supplied a non-empty one.
    pub fn identity(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.identity_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Tells every open WebSocket to close.
    pub fn close_connections(&self) {
        self.closing.send_replace(true);
    }

    /// Resolves once [`AppState::close_connections`] has been called.
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }
}
