//! HTTP server implementation using Axum.
//!
//! `/ws` carries the command and event protocol; `/api/sessions` lets a user
//! inspect and end their own sessions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use crate::ids::SessionId;
use crate::mux::SessionInfo;
use crate::protocol::{ClientMessage, Reply, ServerMessage};
use crate::state::AppState;

const REAP_INTERVAL: Duration = Duration::from_secs(60);
const REPLY_BUFFER: usize = 64;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds the router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", delete(delete_session))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` resolves, then cancels every process, closes the
/// open sockets and drains connections.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let reaper = spawn_reaper(state.gateway.clone());
    let on_shutdown = state.clone();

    if let Ok(addr) = listener.local_addr() {
        info!("Starting HTTP server on {}", addr);
    }
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutdown requested");
            on_shutdown.gateway.shutdown().await;
            on_shutdown.close_connections();
        })
        .await;

    reaper.abort();
    result
}

fn spawn_reaper(gateway: Arc<Gateway>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            let expired = gateway.expire_idle_sessions().await;
            if expired > 0 {
                info!("Expired {} idle sessions", expired);
            }
        }
    })
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::PathEscape(_) | GatewayError::RootProtected => StatusCode::FORBIDDEN,
        GatewayError::ResourceLimitExceeded { .. } | GatewayError::StreamBusy(_) => {
            StatusCode::TOO_MANY_REQUESTS
        }
        GatewayError::SpawnFailed { .. } | GatewayError::SystemFailure { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({ "kind": self.code(), "message": self.to_string() });
        (status_for(&self), Json(body)).into_response()
    }
}

fn require_identity(state: &AppState, headers: &HeaderMap) -> Result<String> {
    state
        .identity(headers)
        .ok_or_else(|| GatewayError::Unauthorized("missing identity header".to_string()))
}

async fn health() -> &'static str {
    "OK"
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionInfo>>> {
    let identity = require_identity(&state, &headers)?;
    Ok(Json(state.gateway.sessions(&identity).await))
}

async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let identity = require_identity(&state, &headers)?;
    let session: SessionId = id
        .parse()
        .map_err(|_| GatewayError::NotFound(format!("session {id}")))?;
    state.gateway.end_session(&identity, session).await?;
    info!("Deleted session: {}", session);
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match require_identity(&state, &headers) {
        Ok(identity) => ws.on_upgrade(move |socket| handle_socket(socket, state, identity)),
        Err(e) => e.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: String) {
    let gateway = state.gateway.clone();
    let (session, mut feed) = match gateway.connect(Some(&identity)).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!(error = %e, "Rejected connection");
            return;
        }
    };

    let (mut sink, mut frames) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(REPLY_BUFFER);

    let mut writer = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = reply_rx.recv() => msg,
                Some(event) = feed.next() => ServerMessage::from(event),
                else => break,
            };
            if sink.send(Message::Text(msg.to_json())).await.is_err() {
                break;
            }
        }
    });

    let mut closing = state.closing();
    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = closing.wait_for(|closed| *closed) => break,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    let err = GatewayError::InvalidRequest("frames must be UTF-8 JSON".to_string());
                    let _ = reply_tx.send(ServerMessage::error(None, &err)).await;
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(session = %session, error = %e, "WebSocket read failed");
                break;
            }
        };

        let ClientMessage { id, command } = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                let err = GatewayError::InvalidRequest(e.to_string());
                let _ = reply_tx.send(ServerMessage::error(None, &err)).await;
                continue;
            }
        };

        // Stream control runs inline so keystrokes keep their order; the
        // rest may take a while and runs concurrently.
        let quiet = id.is_none() && command.is_stream_control();
        if command.is_stream_control() {
            let result = gateway.execute(session, command).await;
            if !respond(&reply_tx, id, quiet, result).await {
                break;
            }
        } else {
            let gateway = gateway.clone();
            let tx = reply_tx.clone();
            tokio::spawn(async move {
                let result = gateway.execute(session, command).await;
                respond(&tx, id, quiet, result).await;
            });
        }
    }

    let cancelled = gateway.disconnect(session).await;
    debug!(session = %session, cancelled, "Connection closed");
    drop(reply_tx);
    // Let pending replies and end-of-stream events reach the client.
    if timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Sends the outcome of one command. Returns `false` when the session is no
/// longer authorized and the connection should end.
async fn respond(
    tx: &mpsc::Sender<ServerMessage>,
    id: Option<u64>,
    quiet: bool,
    result: Result<Reply>,
) -> bool {
    match result {
        Ok(_) if quiet => true,
        Ok(reply) => {
            let _ = tx.send(ServerMessage::Reply { id, result: reply }).await;
            true
        }
        Err(e) => {
            let _ = tx.send(ServerMessage::error(id, &e)).await;
            !matches!(e, GatewayError::Unauthorized(_))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StreamId;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            status_for(&GatewayError::Unauthorized("x".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&GatewayError::PathEscape("..".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&GatewayError::InvalidPackageName("a;b".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&GatewayError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&GatewayError::StreamBusy(StreamId::from_raw(1))),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
