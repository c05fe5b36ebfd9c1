use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::{Discussion, DiscussionStatus, Message as TranscriptMessage};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DiscussionEvent {
    DiscussionCreated {
        discussion: Discussion,
    },
    DiscussionStarted {
        discussion_id: Uuid,
        phase: Option<String>,
        participants: Vec<String>,
    },
    TurnCompleted {
        discussion_id: Uuid,
        turn: u32,
        message: TranscriptMessage,
    },
    /// A generated utterance carried a name that matched no participant.
    AttributionFallback {
        discussion_id: Uuid,
        turn: u32,
        reported_name: String,
        attributed_to: String,
    },
    PhaseChanged {
        discussion_id: Uuid,
        from: Option<String>,
        to: String,
        status: DiscussionStatus,
    },
    DiscussionPaused {
        discussion_id: Uuid,
        message_count: usize,
    },
    DiscussionResumed {
        discussion_id: Uuid,
        remaining_turns: u32,
    },
    DiscussionCompleted {
        discussion_id: Uuid,
        message_count: usize,
    },
    DiscussionFailed {
        discussion_id: Uuid,
        status: DiscussionStatus,
        error: String,
    },
}

// ── WebSocket handler ────────────────────────────────────────────────

/// WebSocket handler that subscribes to the given broadcast sender.
pub async fn ws_handler_with_sender(
    ws: WebSocketUpgrade,
    tx: broadcast::Sender<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, tx))
}

async fn handle_socket(socket: WebSocket, tx: broadcast::Sender<String>) {
    let (sender, receiver) = socket.split();
    let rx = tx.subscribe();
    debug!("websocket client connected");
    run_socket_loop(sender, receiver, rx).await;
    debug!("websocket client disconnected");
}

/// Forward broadcast events to one client with ping/pong keepalive.
///
/// If no Pong arrives within [`PONG_TIMEOUT`] after a Ping, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket client lagged behind event stream");
                        continue;
                    }
                }
            }

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

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast an event to all connected WebSocket clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &DiscussionEvent) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            warn!(error = %e, "failed to serialize websocket message");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
