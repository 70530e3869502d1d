//! Session events and their WebSocket stream.
//!
//! The [`Session`](crate::Session) publishes a [`SessionEvent`] whenever
//! something a learner can see changes: the transcript, diagnostics,
//! verification results and progression. Connected clients receive every
//! event as a JSON text frame.
//!
//! # Event Types
//!
//! - `connected` - Sent when a client connects, carries the session view
//! - `transcript` - Terminal state or transcript changed
//! - `diagnostics` - Merged diagnostics and editor markers changed
//! - `verification` - A submission was verified
//! - `progress` - A first-time pass changed the economy
//! - `error` - A system failure the learner should know about
//!
//! # Example
//!
//! ```no_run
//! use codequest_engine::websocket::{EventBroadcaster, SessionEvent};
//!
//! # async fn example() {
//! let broadcaster = EventBroadcaster::new(100);
//! let mut receiver = broadcaster.subscribe();
//!
//! broadcaster.send(SessionEvent::error("sandbox unreachable", None));
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {}", event.event_name());
//! }
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::diagnostics::{Diagnostic, EditorMarker};
use crate::error::FailureClass;
use crate::progression::ProgressionDelta;
use crate::session::{Session, SessionView};
use crate::sync::SyncStatus;
use crate::terminal::TerminalState;
use crate::verify::VerificationReport;

// ============================================================================
// Event Payloads
// ============================================================================

/// Payload for the `connected` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    /// The session as it is right now.
    pub session: SessionView,
}

/// Payload for the `transcript` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptPayload {
    /// Terminal state.
    pub state: TerminalState,
    /// Full transcript.
    pub transcript: String,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
}

/// Payload for the `diagnostics` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsPayload {
    /// Merged lint and compiler diagnostics.
    pub diagnostics: Vec<Diagnostic>,
    /// The same diagnostics as editor markers.
    pub markers: Vec<EditorMarker>,
}

/// Payload for the `verification` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationPayload {
    /// The verification report.
    pub report: VerificationReport,
}

/// Payload for the `progress` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressPayload {
    /// What the pass awarded.
    pub delta: ProgressionDelta,
    /// Profile sync status after logging the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncStatus>,
}

/// Payload for the `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error message.
    pub message: String,
    /// Failure category, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<FailureClass>,
}

// ============================================================================
// Event Enum
// ============================================================================

/// Events published by a session.
///
/// Serialized as JSON objects with "event" and "payload" fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Sent when a client connects.
    Connected(ConnectedPayload),
    /// Terminal changed.
    Transcript(TranscriptPayload),
    /// Diagnostics changed.
    Diagnostics(DiagnosticsPayload),
    /// A submission was verified.
    Verification(VerificationPayload),
    /// Economy changed.
    Progress(ProgressPayload),
    /// A system failure.
    Error(ErrorPayload),
}

impl SessionEvent {
    /// Creates a `Connected` event.
    #[must_use]
    pub const fn connected(session: SessionView) -> Self {
        Self::Connected(ConnectedPayload { session })
    }

    /// Creates a `Transcript` event stamped with the current time.
    #[must_use]
    pub fn transcript(state: TerminalState, transcript: String) -> Self {
        Self::Transcript(TranscriptPayload {
            state,
            transcript,
            timestamp: Utc::now(),
        })
    }

    /// Creates a `Diagnostics` event.
    #[must_use]
    pub const fn diagnostics(diagnostics: Vec<Diagnostic>, markers: Vec<EditorMarker>) -> Self {
        Self::Diagnostics(DiagnosticsPayload {
            diagnostics,
            markers,
        })
    }

    /// Creates a `Verification` event.
    #[must_use]
    pub const fn verification(report: VerificationReport) -> Self {
        Self::Verification(VerificationPayload { report })
    }

    /// Creates a `Progress` event.
    #[must_use]
    pub const fn progress(delta: ProgressionDelta, sync: Option<SyncStatus>) -> Self {
        Self::Progress(ProgressPayload { delta, sync })
    }

    /// Creates an `Error` event.
    #[must_use]
    pub fn error(message: impl Into<String>, class: Option<FailureClass>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
            class,
        })
    }

    /// Returns the event name as a string.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Transcript(_) => "transcript",
            Self::Diagnostics(_) => "diagnostics",
            Self::Verification(_) => "verification",
            Self::Progress(_) => "progress",
            Self::Error(_) => "error",
        }
    }
}

// ============================================================================
// Event Broadcaster
// ============================================================================

/// Fans session events out to every subscriber.
///
/// Events are not kept for clients that connect later; they get the current
/// view in their `connected` event instead.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBroadcaster {
    /// Creates a broadcaster that buffers `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new subscriber.
    ///
    /// A subscriber that falls behind receives a `Lagged` error and misses
    /// the overwritten events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Broadcasts an event, returning how many subscribers will see it.
    pub fn send(&self, event: SessionEvent) -> usize {
        // Err only means nobody is listening.
        self.sender.send(event).unwrap_or(0)
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

// ============================================================================
// WebSocket Handler
// ============================================================================

/// Shared state for the WebSocket route.
#[derive(Debug, Clone)]
pub struct WsState {
    /// Source of events.
    pub broadcaster: EventBroadcaster,
    /// The session, for the `connected` snapshot.
    pub session: Arc<Mutex<Session>>,
}

impl WsState {
    /// Creates a `WsState`.
    #[must_use]
    pub const fn new(broadcaster: EventBroadcaster, session: Arc<Mutex<Session>>) -> Self {
        Self {
            broadcaster,
            session,
        }
    }
}

/// Upgrades `GET /ws` to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WsState>>) -> Response {
    debug!("Event socket upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Heartbeat ping period.
const HEARTBEAT: Duration = Duration::from_secs(30);

/// Maximum number of missed pong responses before disconnecting.
const MAX_MISSED_PONGS: u8 = 3;

/// Serves one client: a `connected` snapshot, then every broadcast event,
/// with a heartbeat ping. Three unanswered pings close the connection.
///
/// A client that falls behind the broadcast buffer is sent a fresh
/// `connected` snapshot instead of the events it missed.
async fn handle_socket(socket: WebSocket, state: Arc<WsState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before taking the snapshot so nothing falls in between.
    let mut events = state.broadcaster.subscribe();

    let Some(snapshot) = snapshot_json(&state).await else {
        return;
    };
    if sender.send(Message::Text(snapshot)).await.is_err() {
        debug!("Editor left before the session snapshot was sent");
        return;
    }
    info!(subscribers = state.broadcaster.receiver_count(), "Editor attached to session");

    let mut heartbeat = interval(HEARTBEAT);
    heartbeat.tick().await;
    let mut unanswered = 0u8;

    loop {
        let outgoing = tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Pong(_))) => {
                    unanswered = 0;
                    None
                }
                Some(Ok(Message::Ping(data))) => Some(Message::Pong(data)),
                Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                    debug!("Editor sent data on the event socket; ignored");
                    None
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "Event socket failed");
                    break;
                }
            },

            event = events.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => Some(Message::Text(json)),
                    Err(e) => {
                        warn!(event = event.event_name(), error = %e, "Dropping unserializable event");
                        None
                    }
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Editor fell behind; resending session snapshot");
                    match snapshot_json(&state).await {
                        Some(json) => Some(Message::Text(json)),
                        None => break,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = heartbeat.tick() => {
                unanswered += 1;
                if unanswered > MAX_MISSED_PONGS {
                    info!(unanswered = MAX_MISSED_PONGS, "Editor stopped answering pings");
                    break;
                }
                Some(Message::Ping(Vec::new()))
            }
        };

        if let Some(message) = outgoing {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    }

    info!("Editor detached from session");
}

/// Serializes a `connected` event for the current session state.
async fn snapshot_json(state: &WsState) -> Option<String> {
    let view = match state.session.lock().await.view() {
        Ok(view) => view,
        Err(e) => {
            warn!(error = %e, "Could not snapshot session");
            return None;
        }
    };
    match serde_json::to_string(&SessionEvent::connected(view)) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "Could not serialize session snapshot");
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
