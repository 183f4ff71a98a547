//! Live recognition over a WebSocket.
//!
//! The session logic in [`run_session`] is transport-agnostic: it consumes
//! [`Inbound`] events and emits [`Outbound`] events, and [`ws_handler`] adapts
//! an axum WebSocket onto it.
//!
//! Pings are answered by the reader loop. Image frames go through a small
//! per-connection queue drained by one task, so frames from one client are
//! answered in order while other connections proceed in parallel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::Instrument;

use crate::engine::Identification;
use crate::http::{identified_people, AppState, IdentifiedPerson};
use crate::identity::Owner;
use crate::pipeline::Recognition;

/// Close code: the connection carried no `token` query parameter.
pub const CLOSE_NO_CREDENTIAL: u16 = 4001;
/// Close code: the token did not resolve to a known user.
pub const CLOSE_UNKNOWN_USER: u16 = 4002;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Event received from the client.
#[derive(Debug, Clone)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Event to deliver to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        message: String,
    },
    Pong {
        timestamp: Value,
    },
    FaceDetectionResult {
        message: String,
        identified_people: Vec<IdentifiedPerson>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Drive one client connection until it closes.
///
/// `token` is the raw credential from the connection request. Sends to
/// `outbound` are best effort: a client that has gone away is not an error.
pub async fn run_session(
    state: Arc<AppState>,
    token: Option<String>,
    mut inbound: impl Stream<Item = Inbound> + Unpin,
    outbound: mpsc::Sender<Outbound>,
) {
    let Some(token) = token.filter(|t| !t.trim().is_empty()) else {
        tracing::info!("stream rejected: no credential");
        let _ = outbound
            .send(Outbound::Close {
                code: CLOSE_NO_CREDENTIAL,
                reason: "No credential supplied".into(),
            })
            .await;
        return;
    };
    let Some(owner) = state.verifier.verify(token.trim()).await else {
        tracing::info!("stream rejected: unknown user");
        let _ = outbound
            .send(Outbound::Close {
                code: CLOSE_UNKNOWN_USER,
                reason: "Unknown user".into(),
            })
            .await;
        return;
    };

    let conn = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!("stream", owner = %owner.id, conn);
    async move {
        tracing::info!("stream connected");
        let _ = outbound
            .send(Outbound::Message(ServerMessage::ConnectionEstablished {
                message: format!("Connected as {}", owner.display_name),
            }))
            .await;

        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(state.stream_queue_depth.max(1));
        let frames = tokio::spawn(
            process_frames(Arc::clone(&state), owner.clone(), frame_rx, outbound.clone())
                .in_current_span(),
        );

        while let Some(event) = inbound.next().await {
            let reply = match event {
                Inbound::Close => break,
                Inbound::Binary(bytes) => enqueue(&frame_tx, bytes),
                Inbound::Text(text) => match parse_client_message(&text) {
                    Ok(ClientMessage::Ping(timestamp)) => Some(ServerMessage::Pong { timestamp }),
                    Ok(ClientMessage::Image(bytes)) => enqueue(&frame_tx, bytes),
                    Err(reply) => Some(reply),
                },
            };
            if let Some(reply) = reply {
                if outbound.send(Outbound::Message(reply)).await.is_err() {
                    break;
                }
            }
        }

        // Pending frames are abandoned; their results have nowhere to go.
        drop(frame_tx);
        frames.abort();
        tracing::info!("stream closed");
    }
    .instrument(span)
    .await
}

enum ClientMessage {
    Ping(Value),
    Image(Vec<u8>),
}

/// Parse a text frame. Failures come back as the error message to send.
fn parse_client_message(text: &str) -> Result<ClientMessage, ServerMessage> {
    let value: Value =
        serde_json::from_str(text).map_err(|_| ServerMessage::error("Invalid JSON format"))?;
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();

    match kind {
        "ping" => Ok(ClientMessage::Ping(
            value.get("timestamp").cloned().unwrap_or(Value::Null),
        )),
        "image" => {
            let payload = value.get("image").and_then(Value::as_str).unwrap_or_default();
            decode_image_payload(payload)
                .map(ClientMessage::Image)
                .map_err(ServerMessage::error)
        }
        other => Err(ServerMessage::error(format!("Unknown message type: {other}"))),
    }
}

/// Decode a base64 image, dropping any `data:<mime>;base64,` prefix.
pub fn decode_image_payload(payload: &str) -> Result<Vec<u8>, String> {
    let data = payload
        .split_once(',')
        .map_or(payload, |(_, data)| data)
        .trim();
    if data.is_empty() {
        return Err("No image data received".to_string());
    }
    STANDARD
        .decode(data)
        .map_err(|e| format!("Error processing image: {e}"))
}

/// Queue a frame; a full queue drops it and reports back.
fn enqueue(frames: &mpsc::Sender<Vec<u8>>, bytes: Vec<u8>) -> Option<ServerMessage> {
    if bytes.is_empty() {
        return Some(ServerMessage::error("No image data received"));
    }
    match frames.try_send(bytes) {
        Ok(()) => None,
        Err(TrySendError::Full(_)) => {
            tracing::debug!("frame queue full, frame dropped");
            Some(ServerMessage::error(
                "Still processing previous frames, frame dropped",
            ))
        }
        Err(TrySendError::Closed(_)) => Some(ServerMessage::error(
            "Face recognition is temporarily unavailable",
        )),
    }
}

async fn process_frames(
    state: Arc<AppState>,
    owner: Owner,
    mut frames: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Outbound>,
) {
    while let Some(frame) = frames.recv().await {
        let reply = identify_frame(&state.recognition, &owner, frame).await;
        if outbound.send(Outbound::Message(reply)).await.is_err() {
            break;
        }
    }
}

async fn identify_frame(recognition: &Recognition, owner: &Owner, frame: Vec<u8>) -> ServerMessage {
    match recognition.identify(&owner.id, frame).await {
        Ok(Identification::Matches(results)) if !results.is_empty() => {
            ServerMessage::FaceDetectionResult {
                message: "Face identification completed".to_string(),
                identified_people: identified_people(&results),
            }
        }
        Ok(_) => ServerMessage::FaceDetectionResult {
            message: "No known faces identified".to_string(),
            identified_people: Vec::new(),
        },
        Err(e) => {
            tracing::warn!(error = %e, "frame failed");
            ServerMessage::error(e.user_message())
        }
    }
}

// ============================================================================
// axum adapter
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.token))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let (mut sink, stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(32);

    let writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let message = match event {
                Outbound::Message(msg) => match serde_json::to_string(&msg) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode stream message");
                        continue;
                    }
                },
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let inbound = stream.filter_map(|msg| async move {
        match msg {
            Ok(Message::Text(text)) => Some(Inbound::Text(text)),
            Ok(Message::Binary(bytes)) => Some(Inbound::Binary(bytes)),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Ok(Message::Close(_)) | Err(_) => Some(Inbound::Close),
        }
    });

    run_session(state, token, Box::pin(inbound), out_tx).await;
    let _ = writer.await;
}
