use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::{ApiError, SharedState, USER_HEADER};
use super::models::{Principal, RowChange};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct FeedParams {
    /// Browsers cannot set headers on a WebSocket upgrade, so the principal
    /// may also come as `?user_id=`.
    pub user_id: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<FeedParams>,
) -> Response {
    let from_header = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let Some(user_id) = from_header
        .or(params.user_id)
        .filter(|u| !u.trim().is_empty())
    else {
        return ApiError::Unauthorized.into_response();
    };
    let principal = Principal::new(user_id);
    let rx = state.store.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, principal, rx))
}

async fn handle_socket(socket: WebSocket, principal: Principal, rx: broadcast::Receiver<RowChange>) {
    tracing::debug!(user = %principal, "realtime client connected");
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, &principal).await;
    tracing::debug!(user = %principal, "realtime client disconnected");
}

/// Serialize a change for the wire, or `None` when it belongs to someone
/// else.
pub fn encode_for(principal: &Principal, change: &RowChange) -> Option<String> {
    if change.user_id != principal.user_id {
        return None;
    }
    match serde_json::to_string(change) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize row change");
            None
        }
    }
}

async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<RowChange>,
    principal: &Principal,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!(user = %principal, "pong timeout; closing realtime feed");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Row-change forwarding ───────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(change) => {
                        let Some(json) = encode_for(principal, &change) else {
                            continue;
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(user = %principal, missed, "realtime feed lagged");
                        continue;
                    }
                }
            }

            // ── Client messages (pong, close, etc.) ─────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::models::{ChangeKind, EntityTag};

    fn change(user: &str) -> RowChange {
        RowChange {
            table: EntityTag::Messages,
            kind: ChangeKind::Insert,
            id: 7,
            user_id: user.into(),
            parent_id: Some(3),
        }
    }

    #[test]
    fn test_encode_filters_other_principals() {
        let alice = Principal::new("alice");
        assert!(encode_for(&alice, &change("bob")).is_none());
        let json = encode_for(&alice, &change("alice")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["table"], "messages");
        assert_eq!(parsed["kind"], "insert");
        assert_eq!(parsed["parent_id"], 3);
    }

    #[test]
    fn test_keepalive_constants() {
        assert_eq!(PING_INTERVAL, Duration::from_secs(30));
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }
}
