//! Connection Handler (C7): per-connection WebSocket event loop implementing
//! the `terminal:*` protocol (§6).
//!
//! ## Message types (client → server)
//!
//! | Type              | Fields                                          | Response(s)                 |
//! |-------------------|--------------------------------------------------|------------------------------|
//! | `terminal:start`  | `projectId?`, `userId?`, `language`              | `terminal:ready` or `terminal:error` |
//! | `terminal:input`  | `sessionId`, `data`                              | (none on success)            |
//! | `terminal:resize` | `sessionId`, `cols`, `rows`                      | (none on success)            |
//! | `terminal:stop`   | `sessionId`                                      | `terminal:exit`               |
//!
//! ## Message types (server → client)
//!
//! `terminal:ready`, `terminal:data`, `terminal:exit`, `terminal:error`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::input::{validate_input, validate_resize, RawInput};
use crate::sandbox::SizeHint;
use crate::session::{outbound_event_bytes, OutboundEvent, OutboundQueue};
use crate::AppState;

/// Incoming `terminal:*` messages, discriminated by `"type"`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "terminal:start")]
    Start {
        #[serde(rename = "projectId")]
        project_id: Option<String>,
        #[serde(rename = "userId")]
        user_id: Option<String>,
        language: String,
    },
    #[serde(rename = "terminal:input")]
    Input {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: Value,
    },
    #[serde(rename = "terminal:resize")]
    Resize {
        #[serde(rename = "sessionId")]
        session_id: String,
        cols: i64,
        rows: i64,
    },
    #[serde(rename = "terminal:stop")]
    Stop {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// `GET /ws` — WebSocket upgrade. Authentication, if any, is layered in
/// front of this broker by an external collaborator (§1 Non-goals).
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state)).into_response()
}

fn outbound_event_to_json(event: OutboundEvent) -> Value {
    match event {
        OutboundEvent::Ready { session_id } => json!({
            "type": "terminal:ready",
            "sessionId": session_id,
        }),
        OutboundEvent::Data { session_id, chunk } => json!({
            "type": "terminal:data",
            "sessionId": session_id,
            "chunk": chunk,
        }),
        OutboundEvent::Exit { session_id, reason, code } => json!({
            "type": "terminal:exit",
            "sessionId": session_id,
            "reason": reason,
            "code": code,
        }),
        OutboundEvent::Error { session_id, error, failure_count, backoff_seconds } => {
            let mut msg = json!({
                "type": "terminal:error",
                "sessionId": session_id,
                "code": error.code(),
                "message": error.to_string(),
                "isRetryable": error.is_retryable(),
            });
            if let Value::Object(ref mut map) = msg {
                if let Some(fc) = failure_count {
                    map.insert("failureCount".into(), json!(fc));
                }
                if let Some(bs) = backoff_seconds {
                    map.insert("backoffSeconds".into(), json!(bs));
                }
                if let BrokerError::RateLimited { retry_after_secs } = error {
                    map.insert("retryAfter".into(), json!(retry_after_secs));
                }
            }
            msg
        }
    }
}

/// Main per-connection event loop. Mirrors the mpsc-to-sink pattern: session
/// tasks never touch the socket directly, they push onto the connection's
/// `OutboundQueue` and a single `send_task` drains it into the WS sink so
/// outbound order is preserved per connection (§5 ordering guarantees).
async fn handle_ws(socket: axum::extract::ws::WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!(connection_id, "connection opened");
    state.connections.lock().await.insert(connection_id.clone());

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut events_rx) = mpsc::channel::<OutboundEvent>(256);
    let outbound = OutboundQueue::new(tx, state.config.broker.max_outbound_queue_bytes);
    let queued_bytes = outbound.queued_bytes_handle();

    let send_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let size = outbound_event_bytes(&event);
            let value = outbound_event_to_json(event);
            if size > 0 {
                queued_bytes.fetch_sub(size, Ordering::Relaxed);
            }
            let text = match serde_json::to_string(&value) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if ws_sink
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        let axum::extract::ws::Message::Text(text) = msg else {
            continue;
        };
        let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) else {
            let _ = outbound
                .send(OutboundEvent::Error {
                    session_id: None,
                    error: BrokerError::InvalidInput("unrecognized message"),
                    failure_count: None,
                    backoff_seconds: None,
                })
                .await;
            continue;
        };

        if let Err(err) = dispatch(&state, &connection_id, client_msg, &outbound).await {
            let _ = outbound
                .send(OutboundEvent::Error {
                    session_id: None,
                    error: err,
                    failure_count: None,
                    backoff_seconds: None,
                })
                .await;
        }
    }

    state.registry.remove_by_connection(&connection_id).await;
    state.health_gate.forget(&connection_id);
    state.connections.lock().await.remove(&connection_id);
    drop(outbound);
    let _ = send_task.await;
    info!(connection_id, "connection closed");
}

async fn dispatch(
    state: &AppState,
    connection_id: &str,
    msg: ClientMessage,
    outbound: &OutboundQueue,
) -> Result<(), BrokerError> {
    match msg {
        ClientMessage::Start {
            language, ..
        } => handle_start(state, connection_id, &language, outbound).await,
        ClientMessage::Input { session_id, data } => {
            let Some(session) = state.registry.get(&session_id).await else {
                return Err(BrokerError::SessionNotFound);
            };
            let raw = match data {
                Value::String(s) => RawInput::Text(s),
                Value::Array(arr) => {
                    let mut bytes = Vec::with_capacity(arr.len());
                    for v in arr {
                        let b = v
                            .as_u64()
                            .and_then(|n| u8::try_from(n).ok())
                            .ok_or(BrokerError::InvalidInput("non-byte array element"))?;
                        bytes.push(b);
                    }
                    RawInput::Bytes(bytes)
                }
                _ => return Err(BrokerError::InvalidInput("data must be string or byte array")),
            };
            let bytes = validate_input(raw, state.config.broker.max_input_bytes)?;
            session.write(&bytes).await
        }
        ClientMessage::Resize { session_id, cols, rows } => {
            let (cols, rows) = validate_resize(cols, rows)?;
            let Some(session) = state.registry.get(&session_id).await else {
                return Err(BrokerError::SessionNotFound);
            };
            session.resize(cols, rows).await;
            Ok(())
        }
        ClientMessage::Stop { session_id } => {
            let Some(session) = state.registry.get(&session_id).await else {
                return Err(BrokerError::SessionNotFound);
            };
            session.stop("user requested").await;
            Ok(())
        }
    }
}

async fn handle_start(
    state: &AppState,
    connection_id: &str,
    language: &str,
    outbound: &OutboundQueue,
) -> Result<(), BrokerError> {
    let images = state.config.language_images();
    if !images.contains_key(language) {
        return Err(BrokerError::InvalidInput("unsupported language"));
    }

    state.health_gate.admit_start(connection_id)?;

    let adapter: Arc<dyn crate::sandbox::SandboxAdapter> = Arc::clone(&state.adapter);
    let result = state
        .registry
        .create(
            connection_id,
            language,
            SizeHint::default(),
            adapter,
            state.config.stream_policy(),
            state.config.session_timeouts(),
            outbound.clone(),
        )
        .await;

    match result {
        Ok(_session) => {
            state.health_gate.on_start_outcome(connection_id, false);
            Ok(())
        }
        Err(e) if e.is_sandbox_failure() => {
            if let Some((failure_count, backoff_seconds)) =
                state.health_gate.on_start_outcome(connection_id, true)
            {
                let _ = outbound
                    .send(OutboundEvent::Error {
                        session_id: None,
                        error: e,
                        failure_count: Some(failure_count),
                        backoff_seconds: Some(backoff_seconds),
                    })
                    .await;
                return Ok(());
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}
