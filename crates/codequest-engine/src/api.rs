//! HTTP API for a learner session.
//!
//! A browser editor drives one [`Session`] through these endpoints and
//! watches it over the WebSocket at `/ws`.
//!
//! # Endpoints
//!
//! - `GET /api/challenges` - List the catalog
//! - `GET /api/session` - Current session view
//! - `POST /api/session/challenge` - Select a challenge by index or id
//! - `PUT /api/session/source` - Replace the source buffer (linted in the background)
//! - `POST /api/session/run` - Run the buffer
//! - `PUT /api/session/transcript` - Edit the transcript while awaiting input
//! - `POST /api/session/input` - Submit an input line
//! - `POST /api/session/submit` - Verify the buffer against the challenge
//! - `POST /api/session/close` - Close the session
//! - `GET /ws` - Session events
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use codequest_engine::{create_router, AppState, Catalog, Config, Session};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let session = Session::new(
//!     Arc::new(Catalog::builtin()),
//!     config.sandbox.build()?,
//!     config.session_settings(),
//! )?;
//!
//! let router = create_router(AppState::new(session, Duration::from_millis(500)));
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//! axum::serve(listener, router).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::catalog::ChallengeInfo;
use crate::error::EngineError;
use crate::lint::LintDebouncer;
use crate::session::{RunOutcome, Session, SessionView, SubmitOutcome};
use crate::websocket::{ws_handler, EventBroadcaster, WsState};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for `POST /api/session/challenge`.
///
/// Exactly one of `index` and `id` must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectChallengeRequest {
    /// Catalog position.
    #[serde(default)]
    pub index: Option<usize>,
    /// Challenge id.
    #[serde(default)]
    pub id: Option<String>,
}

/// Request body for `PUT /api/session/source`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRequest {
    /// The new source buffer.
    pub source: String,
}

/// Request body for `PUT /api/session/transcript`.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptRequest {
    /// The edited transcript.
    pub transcript: String,
}

/// Request body for `POST /api/session/input`.
///
/// With `line`, the line is typed and submitted. Without it, whatever was
/// typed after the prompt via `PUT /api/session/transcript` is submitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InputRequest {
    /// Line to type.
    #[serde(default)]
    pub line: Option<String>,
}

/// Error response body returned on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Description of the error.
    pub error: String,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared state for the HTTP server.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The learner session.
    pub session: Arc<Mutex<Session>>,
    /// Session events.
    pub events: EventBroadcaster,
    /// Background linting of source updates.
    pub lint: LintDebouncer,
    cancel: CancelToken,
}

impl AppState {
    /// Wraps `session` for the server and starts background linting.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(session: Session, lint_debounce: Duration) -> Self {
        let events = EventBroadcaster::default();
        let session = session.with_events(events.clone());
        let cancel = session.cancel_token();
        let (lint, mut results) =
            LintDebouncer::spawn(session.linter(), lint_debounce, cancel.clone());
        let session = Arc::new(Mutex::new(session));

        let target = Arc::clone(&session);
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                target.lock().await.apply_lint(result);
            }
            debug!("Lint result stream ended");
        });

        Self {
            session,
            events,
            lint,
            cancel,
        }
    }
}

// ============================================================================
// API Error Type
// ============================================================================

/// Error type for API handlers.
#[derive(Debug)]
enum ApiError {
    /// The request itself is malformed.
    BadRequest(String),
    /// The engine refused the operation.
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Engine(e) => {
                let status = match &e {
                    EngineError::UnknownChallenge { .. }
                    | EngineError::ChallengeIndexOutOfRange { .. } => StatusCode::NOT_FOUND,
                    EngineError::HistoryRewrite | EngineError::InvalidStateTransition { .. } => {
                        StatusCode::CONFLICT
                    }
                    EngineError::SessionClosed => StatusCode::GONE,
                    e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    warn!(error = %e, "Request failed");
                }
                (status, e.to_string())
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the router with all API endpoints, the WebSocket route, CORS for
/// development and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ws_state = Arc::new(WsState::new(
        state.events.clone(),
        Arc::clone(&state.session),
    ));

    let api_routes = Router::new()
        .route("/challenges", get(handle_challenges))
        .route("/session", get(handle_view))
        .route("/session/challenge", post(handle_select_challenge))
        .route("/session/source", put(handle_source))
        .route("/session/run", post(handle_run))
        .route("/session/transcript", put(handle_transcript))
        .route("/session/input", post(handle_input))
        .route("/session/submit", post(handle_submit))
        .route("/session/close", post(handle_close));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_handler).with_state(ws_state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for `GET /api/challenges`.
async fn handle_challenges(State(state): State<Arc<AppState>>) -> Json<Vec<ChallengeInfo>> {
    let session = state.session.lock().await;
    Json(session.catalog().iter().map(|c| c.info()).collect())
}

/// Handler for `GET /api/session`.
async fn handle_view(State(state): State<Arc<AppState>>) -> Result<Json<SessionView>, ApiError> {
    Ok(Json(state.session.lock().await.view()?))
}

/// Handler for `POST /api/session/challenge`.
async fn handle_select_challenge(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SelectChallengeRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let mut session = state.session.lock().await;
    match (request.index, request.id) {
        (Some(index), None) => session.select_challenge(index)?,
        (None, Some(id)) => session.select_challenge_by_id(&id)?,
        _ => {
            return Err(ApiError::BadRequest(
                "set exactly one of 'index' and 'id'".to_string(),
            ))
        }
    }
    Ok(Json(session.view()?))
}

/// Handler for `PUT /api/session/source`.
///
/// Accepted immediately; diagnostics follow on the WebSocket once the lint
/// window elapses.
async fn handle_source(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SourceRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .session
        .lock()
        .await
        .set_source(request.source.clone())?;
    state.lint.schedule(request.source);
    Ok(StatusCode::ACCEPTED)
}

/// Handler for `POST /api/session/run`.
async fn handle_run(State(state): State<Arc<AppState>>) -> Result<Json<RunOutcome>, ApiError> {
    let outcome = state.session.lock().await.run().await?;
    info!(state = %outcome.state, failure = ?outcome.failure, "Run step finished");
    Ok(Json(outcome))
}

/// Handler for `PUT /api/session/transcript`.
async fn handle_transcript(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TranscriptRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .session
        .lock()
        .await
        .edit_transcript(&request.transcript)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `POST /api/session/input`.
async fn handle_input(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InputRequest>,
) -> Result<Json<RunOutcome>, ApiError> {
    let mut session = state.session.lock().await;
    let outcome = match request.line {
        Some(line) => session.submit_line(&line).await?,
        None => session.submit_input().await?,
    };
    Ok(Json(outcome))
}

/// Handler for `POST /api/session/submit`.
async fn handle_submit(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SubmitOutcome>, ApiError> {
    let outcome = state.session.lock().await.submit().await?;
    info!(
        passed = outcome.report.passed,
        stars = ?outcome.report.stars,
        "Submission verified"
    );
    Ok(Json(outcome))
}

/// Handler for `POST /api/session/close`.
///
/// Cancels before taking the lock so an in-flight sandbox call gives it up.
async fn handle_close(State(state): State<Arc<AppState>>) -> StatusCode {
    state.cancel.cancel();
    state.session.lock().await.close();
    StatusCode::NO_CONTENT
}
