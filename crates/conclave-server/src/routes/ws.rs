//! The two websocket endpoints: one per connected agent, and a single
//! observer socket that mirrors every teamup and routed message.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use conclave_bus::FrontendEvent;
use conclave_schema::{AgentMessage, ChatRecord, Session};

use crate::state::{AppState, OBSERVER_TOPIC};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/:agent_name", get(agent_socket))
        .route("/chatlist_ws", get(observer_socket))
}

async fn agent_socket(
    Path(agent_name): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(agent_name, state, socket))
}

/// One connection per agent name. A second connection under the same name
/// replaces the first (last-writer-wins; see DESIGN.md's Open Question
/// resolution on simultaneous same-name claims).
async fn handle_agent_socket(agent_name: String, state: AppState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<AgentMessage>();

    state
        .connections
        .lock()
        .await
        .insert(agent_name.clone(), outbound_tx.clone());

    let writer_name = agent_name.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                tracing::warn!(agent = %writer_name, "failed to serialize outbound message");
                continue;
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                tracing::info!(agent = %agent_name, %err, "agent socket closed");
                break;
            }
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        route_incoming_message(&state, &agent_name, &text).await;
    }

    writer.abort();
    let mut connections = state.connections.lock().await;
    // Only drop the entry if nobody reconnected under this name while this
    // socket was closing down.
    if connections
        .get(&agent_name)
        .is_some_and(|current| current.same_channel(&outbound_tx))
    {
        connections.remove(&agent_name);
    }
}

/// The Router's message routing algorithm:
/// 1. Validate JSON -> `AgentMessage`; drop with log if invalid.
/// 2. Look up the session by `comm_id`; drop with log if absent.
/// 3. Append to the session's archived chat record.
/// 4. Emit to the observer stream, tagged `type = "message"`.
/// 5. For every member (including the sender), deliver if that member has
///    a live connection. Absent members miss it; there is no store-and-forward.
async fn route_incoming_message(state: &AppState, sender_socket_name: &str, raw: &str) {
    let message: AgentMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(agent = %sender_socket_name, %err, "dropping malformed agent message");
            return;
        }
    };

    let comm_id = message.comm_id;

    let session = match state.sessions.get::<Session>("sessions", &comm_id.to_string()).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            tracing::warn!(%comm_id, "dropping message for unknown session");
            return;
        }
        Err(err) => {
            tracing::warn!(%comm_id, %err, "dropping message, session lookup failed");
            return;
        }
    };

    append_to_chat_record(state, comm_id, &message).await;

    state
        .observer_bus
        .publish(OBSERVER_TOPIC, FrontendEvent::Message(message.clone()));

    let connections = state.connections.lock().await;
    for member in &session.member_names {
        if let Some(sender) = connections.get(member) {
            if sender.send(message.clone()).is_err() {
                tracing::info!(agent = %member, "dropping message, receiver gone");
            }
        }
    }
}

async fn append_to_chat_record(state: &AppState, comm_id: uuid::Uuid, message: &AgentMessage) {
    let key = comm_id.to_string();
    let mut record = match state.chat.get::<ChatRecord>("chat", &key).await {
        Ok(Some(record)) => record,
        Ok(None) => ChatRecord::new(comm_id, Vec::new(), None),
        Err(err) => {
            tracing::warn!(%comm_id, %err, "chat record corrupt, starting a fresh one");
            ChatRecord::new(comm_id, Vec::new(), None)
        }
    };
    record.append(message.clone());
    if let Err(err) = state.chat.put("chat", &key, &record).await {
        tracing::warn!(%comm_id, %err, "failed to persist chat record append");
    }
}

async fn observer_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer_socket(state, socket))
}

async fn handle_observer_socket(state: AppState, socket: WebSocket) {
    let mut receiver = state.observer_bus.subscribe(OBSERVER_TOPIC);
    let (mut ws_tx, mut ws_rx) = socket.split();

    let forward = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // The observer socket is read-only from the client's perspective; drain
    // incoming frames only to notice disconnects.
    while let Some(frame) = ws_rx.next().await {
        if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
            break;
        }
    }

    forward.abort();
}
