use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use stormforge_core::roles::Identity;
use stormforge_core::types::JobId;
use stormforge_events::{Event, EventKind, Scope, Subscription};

use crate::error::AppResult;
use crate::handlers::system::system_stats;
use crate::middleware::auth::WsAuthUser;
use crate::state::AppState;
use crate::ws::manager::Delivery;

/// How long a queued close frame may take to reach a client that has
/// stopped reading.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    RequestStats,
}

/// GET /api/v1/ws/monitor
///
/// Global subscription, filtered by the caller's role. Authentication is
/// checked before the upgrade headers.
pub async fn monitor_ws_handler(
    WsAuthUser(user): WsAuthUser,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let identity = user.identity();
    let subscription = state.orchestrator.subscribe(&identity, Scope::Global)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, identity, subscription)))
}

/// GET /api/v1/ws/jobs/{id}
///
/// Events for one job. Rejected before the upgrade if the job is unknown or
/// not visible to the caller.
pub async fn job_ws_handler(
    WsAuthUser(user): WsAuthUser,
    Path(job_id): Path<JobId>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let identity = user.identity();
    let subscription = state.orchestrator.subscribe(&identity, Scope::Job(job_id))?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, identity, subscription)))
}

fn to_message(event: &Event) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize event");
            None
        }
    }
}

/// Manage a single WebSocket connection after upgrade.
///
///   1. Registers the connection with `WsManager` and sends the greeting
///      (plus the current snapshot for a job scope).
///   2. A sender task drains the manager channel into the socket.
///   3. A forwarder task moves bus events into the manager channel. If
///      that bounded channel is full, or the bus dropped the subscription,
///      the connection is closed with a policy-violation frame.
///   4. Inbound frames are processed on the current task.
///
/// The connection ends when the client leaves, the sink fails, the
/// forwarder gives up, or the heartbeat drops it.
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    identity: Identity,
    mut subscription: Subscription,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let scope = subscription.scope();
    let ws_manager = state.ws_manager.clone();
    tracing::info!(conn_id = %conn_id, user_id = identity.user_id, ?scope, "WebSocket connected");

    let mut rx = ws_manager.add(conn_id.clone(), identity, scope).await;
    let (mut sink, mut stream) = socket.split();

    let sender_conn_id = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let greeting = Event::new(EventKind::ConnectionEstablished).with_data(json!({
        "connection_id": conn_id,
        "user_id": identity.user_id,
        "role": identity.role,
        "scope": scope,
    }));
    if let Some(msg) = to_message(&greeting) {
        ws_manager.send_to(&conn_id, msg).await;
    }
    if let Scope::Job(job_id) = scope {
        if let Ok(snapshot) = state.orchestrator.get(&identity, job_id) {
            subscription.resume_after(job_id, snapshot.seq);
            if let Some(msg) = to_message(&Event::job_status(&snapshot)) {
                ws_manager.send_to(&conn_id, msg).await;
            }
        }
    }

    let forward_manager = ws_manager.clone();
    let forward_conn_id = conn_id.clone();
    let mut forward_task = tokio::spawn(async move {
        let overflowed = loop {
            let Some(event) = subscription.recv().await else {
                break subscription.is_evicted();
            };
            let Some(msg) = to_message(&event) else {
                continue;
            };
            match forward_manager.deliver(&forward_conn_id, msg).await {
                Delivery::Queued => {}
                Delivery::Full => break true,
                Delivery::Gone => return,
            }
        };
        if overflowed {
            tracing::warn!(conn_id = %forward_conn_id, "Subscriber fell behind, closing connection");
            forward_manager
                .send_to(
                    &forward_conn_id,
                    Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: "event buffer overflow".into(),
                    })),
                )
                .await;
        }
    });

    let recv_loop = async {
        while let Some(result) = stream.next().await {
            ws_manager.touch(&conn_id).await;
            match result {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    handle_client_message(&state, &conn_id, text.as_str()).await;
                }
                Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => {
                    tracing::trace!(conn_id = %conn_id, "Keepalive frame received");
                }
                Ok(Message::Binary(_)) => {}
                Err(e) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    };

    let forwarder_done = tokio::select! {
        () = recv_loop => false,
        _ = &mut send_task => false,
        _ = &mut forward_task => true,
    };
    if forwarder_done {
        // A stalled client must not hold the connection open.
        let _ = tokio::time::timeout(CLOSE_GRACE, &mut send_task).await;
    }

    // Clean up: dropping the forwarder drops the subscription.
    ws_manager.remove(&conn_id).await;
    forward_task.abort();
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

async fn handle_client_message(state: &AppState, conn_id: &str, text: &str) {
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping) => Event::new(EventKind::Pong),
        Ok(ClientMessage::RequestStats) => {
            let stats = system_stats(state).await;
            Event::new(EventKind::SystemStats)
                .with_data(serde_json::to_value(stats).unwrap_or_default())
        }
        Err(e) => {
            tracing::debug!(conn_id = %conn_id, error = %e, "Ignoring unrecognised client message");
            return;
        }
    };
    if let Some(msg) = to_message(&reply) {
        state.ws_manager.send_to(conn_id, msg).await;
    }
}
