//! WebSocket upgrade handler and per-connection event loop.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::AppState;

use super::connection::ConnectionManager;
use super::events::{ClientEvent, ServerEvent};

/// Cookie carrying the session id. Set by the server on the upgrade
/// response and never readable by page scripts.
pub const SESSION_COOKIE: &str = "relay_sid";

/// Close code sent when no session could be bound (4000-range for
/// application-level).
const CLOSE_SESSION_UNAVAILABLE: u16 = 4003;

#[derive(Debug, Deserialize)]
pub struct SocketParams {
    pub session_id: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/socket", get(ws_upgrade))
}

/// Resolve the client's session before upgrading, creating one when the id
/// is missing or no longer stored, and hand it back as an `HttpOnly` cookie.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<SocketParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let requested = params
        .session_id
        .filter(|s| !s.is_empty())
        .or_else(|| session_cookie(&headers));
    let existing = match requested.as_deref() {
        Some(id) => state.sessions.get(id).await?,
        None => None,
    };
    let session = match existing {
        Some(session) => session,
        None => state.sessions.create().await?,
    };

    let cookie = HeaderValue::from_str(&set_session_cookie(
        &session.session_id,
        state.config.session_ttl_secs,
    ))
    .map_err(|_| ApiError::internal("invalid session cookie"))?;

    let session_id = session.session_id;
    let mut response =
        ws.on_upgrade(move |socket| handle_connection(socket, state, Some(session_id)));
    response.headers_mut().append(SET_COOKIE, cookie);
    Ok(response)
}

fn set_session_cookie(session_id: &str, ttl_secs: u64) -> String {
    format!("{SESSION_COOKIE}={session_id}; Path=/; Max-Age={ttl_secs}; HttpOnly; SameSite=Strict")
}

/// Extract the session id from the `Cookie` header(s), if present.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

async fn handle_connection(socket: WebSocket, state: AppState, session_id: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbox, mut inbox) = mpsc::unbounded_channel::<ServerEvent>();
    let mut conn = ConnectionManager::from_state(&state, outbox);

    if let Err(err) = state.router.connect(&mut conn, session_id.as_deref()).await {
        tracing::warn!(connection_id = conn.id(), %err, "could not bind session");
        let _ = send_close(&mut ws_tx, CLOSE_SESSION_UNAVAILABLE, "Session unavailable").await;
        return;
    }

    tracing::info!(
        connection_id = conn.id(),
        session_id = conn.session().map(|s| s.session_id.as_str()).unwrap_or_default(),
        restored = conn.is_registered(),
        "client connected"
    );

    loop {
        tokio::select! {
            // Client sends us a message.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let event = match ClientEvent::parse(text.as_str()) {
                            Ok(event) => event,
                            Err(reason) => {
                                tracing::debug!(connection_id = conn.id(), %reason, "malformed client frame ignored");
                                continue;
                            }
                        };
                        if let Err(err) = state.router.dispatch(&mut conn, event).await {
                            if err.is_client_error() {
                                tracing::debug!(connection_id = conn.id(), %err, "client event rejected");
                            } else {
                                tracing::warn!(connection_id = conn.id(), %err, "client event failed");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = conn.id(), "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Event queued for this connection.
            Some(event) = inbox.recv() => {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(?e, event = event.name(), "failed to encode server event");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.router.disconnect(&mut conn);

    tracing::info!(connection_id = conn.id(), "client disconnected");
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
