use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::SharedState;
use super::models::{FileSizes, JobConfig, JobState, ObserverId};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity of the fan-out channel shared by all sessions.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── WebSocket message types ──────────────────────────────────────────

/// Events pushed from the controller to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WsMessage {
    Status { state: JobState },
    Progress { count: u64 },
    FileSizes(FileSizes),
    DownloadReady,
    Error { message: String },
}

/// Commands sent by an observer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    StartGeneration(JobConfig),
    StopGeneration,
}

// ── Event bus ────────────────────────────────────────────────────────

/// Who an event is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    Observer(ObserverId),
}

/// A serialized event plus its audience, as carried on the bus.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub audience: Audience,
    pub payload: String,
}

impl Envelope {
    pub fn is_for(&self, observer: ObserverId) -> bool {
        match self.audience {
            Audience::All => true,
            Audience::Observer(id) => id == observer,
        }
    }
}

/// Fan-out channel from the controller to every session.
///
/// Publishing never blocks and never fails when nobody is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Deliver to every connected observer.
    pub fn broadcast(&self, msg: &WsMessage) {
        self.publish(Audience::All, msg);
    }

    /// Deliver to a single observer only.
    pub fn send_to(&self, observer: ObserverId, msg: &WsMessage) {
        self.publish(Audience::Observer(observer), msg);
    }

    fn publish(&self, audience: Audience, msg: &WsMessage) {
        match serde_json::to_string(msg) {
            Ok(payload) => {
                let _ = self.tx.send(Envelope { audience, payload }); // Ignore error if no receivers
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize WsMessage");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let observer = uuid::Uuid::new_v4();
    // Subscribe before anything else so no event emitted after connect is missed.
    let rx = state.events.subscribe();
    let (mut sender, receiver) = socket.split();

    tracing::info!(observer = %observer, observers = state.events.observer_count(), "Observer connected");

    if state.replay_state_on_connect {
        let current = match state.controller.state() {
            JobState::Running => JobState::Running,
            _ => JobState::Stopped,
        };
        if send_json(&mut sender, &WsMessage::Status { state: current }).await.is_err() {
            return;
        }
    }

    run_socket_loop(sender, receiver, rx, observer, &state).await;
    tracing::info!(observer = %observer, "Observer disconnected");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines bus forwarding, client command handling, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<Envelope>,
    observer: ObserverId,
    state: &SharedState,
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
                    tracing::debug!(observer = %observer, "Pong timeout, dropping connection");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Bus forwarding ──────────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(envelope) => {
                        if !envelope.is_for(observer) {
                            continue;
                        }
                        if sender.send(Message::Text(envelope.payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(observer = %observer, missed, "Observer lagged behind event bus");
                        continue;
                    }
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_command(text.as_str(), observer, state) {
                            if send_json(&mut sender, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary and Ping frames carry no commands
                    }
                    Some(Err(e)) => {
                        tracing::debug!(observer = %observer, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

/// Apply one client command. Returns a reply meant for the sender only.
fn handle_command(text: &str, observer: ObserverId, state: &SharedState) -> Option<WsMessage> {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!(observer = %observer, error = %e, "Rejected malformed command");
            return Some(WsMessage::Error {
                message: format!("Invalid message: {}", e),
            });
        }
    };

    let result = match command {
        ClientCommand::StartGeneration(config) => state.controller.start(config, observer).map(|_| ()),
        ClientCommand::StopGeneration => state.controller.stop().map(|_| ()),
    };

    match result {
        Ok(()) => None,
        Err(e) => {
            tracing::info!(observer = %observer, error = %e, "Command rejected");
            Some(WsMessage::Error {
                message: e.to_string(),
            })
        }
    }
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &WsMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize WsMessage");
            Ok(())
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
