//! Axum router and all HTTP handlers for vg-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Tests compose the bare router directly.
//!
//! Submit outcome → HTTP status:
//!
//! | outcome                                    | status |
//! |--------------------------------------------|--------|
//! | advanced / stage_complete / gate_complete  | 200    |
//! | invalid                                    | 401    |
//! | stage_out_of_order / session_already_completed | 409 |
//! | unknown_factor                             | 422    |
//! | session_locked (+ `Retry-After`)           | 429    |
//! | session_expired / session_aborted          | 410    |
//!
//! `GET /v1/subjects/:id/session` returns the status of the subject's
//! unfinished session, or 404 when there is none.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};
use uuid::Uuid;
use vg_gate::{FactorId, GateError, Outcome, SessionId, SubjectId};

use crate::{
    api_types::{
        CreateSessionRequest, ErrorResponse, HealthResponse, SessionCreatedResponse, SubmitRequest,
    },
    state::{uptime_secs, AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stream", get(stream))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/:id", get(session_status))
        .route("/v1/sessions/:id/submit", post(submit))
        .route("/v1/sessions/:id/abort", post(abort))
        .route("/v1/subjects/:id/session", get(active_session))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
            uptime_secs: uptime_secs(),
            config_hash: st.config_hash.clone(),
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/sessions
// ---------------------------------------------------------------------------

pub(crate) async fn create_session(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    let subject = req.subject_id.trim();
    if subject.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "subject_id must not be empty");
    }

    match st.gate.create_session(SubjectId::new(subject), req.context).await {
        Ok(s) => (
            StatusCode::CREATED,
            Json(SessionCreatedResponse {
                session_id: s.session_id,
                state: s.state,
                current_stage_order: s.current_stage_order,
                expires_at: s.expires_at,
            }),
        )
            .into_response(),
        Err(e) => gate_error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/sessions/:id/submit
// ---------------------------------------------------------------------------

pub(crate) async fn submit(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<SubmitRequest>,
) -> Response {
    let factor = FactorId::new(req.factor_id);
    match st.gate.submit(SessionId(id), &factor, &req.secret).await {
        Ok(outcome) => {
            info!(session_id = %id, factor_id = %factor, outcome = outcome.kind(), "submit");
            outcome_response(outcome)
        }
        Err(e) => gate_error_response(e),
    }
}

/// Map an outcome to its HTTP status; the body is always the outcome JSON.
pub(crate) fn outcome_response(outcome: Outcome) -> Response {
    let status = match &outcome {
        Outcome::Advanced { .. } | Outcome::StageComplete { .. } | Outcome::GateComplete { .. } => {
            StatusCode::OK
        }
        Outcome::Invalid { .. } => StatusCode::UNAUTHORIZED,
        Outcome::StageOutOfOrder | Outcome::SessionAlreadyCompleted => StatusCode::CONFLICT,
        Outcome::UnknownFactor => StatusCode::UNPROCESSABLE_ENTITY,
        Outcome::SessionLocked { .. } => StatusCode::TOO_MANY_REQUESTS,
        Outcome::SessionExpired | Outcome::SessionAborted => StatusCode::GONE,
    };

    let mut headers = HeaderMap::new();
    if let Outcome::SessionLocked { retry_after } = &outcome {
        let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
            headers.insert(header::RETRY_AFTER, v);
        }
    }

    (status, headers, Json(outcome)).into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/sessions/:id
// ---------------------------------------------------------------------------

pub(crate) async fn session_status(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match st.gate.get_status(SessionId(id)).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => gate_error_response(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/subjects/:id/session
// ---------------------------------------------------------------------------

/// The subject's unfinished session, if any, so a client resumes instead of
/// opening a new one. 404 when there is nothing to resume.
pub(crate) async fn active_session(State(st): State<Arc<AppState>>, Path(subject): Path<String>) -> Response {
    let subject = subject.trim();
    if subject.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "subject_id must not be empty");
    }
    match st.gate.resume_session(&SubjectId::new(subject)).await {
        Ok(Some(status)) => (StatusCode::OK, Json(status)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("no active session for subject {subject}")),
        Err(e) => gate_error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/sessions/:id/abort
// ---------------------------------------------------------------------------

pub(crate) async fn abort(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match st.gate.abort(SessionId(id)).await {
        Ok(ack) => {
            info!(session_id = %id, state = ack.state.as_str(), "abort");
            (StatusCode::OK, Json(ack)).into_response()
        }
        Err(e) => gate_error_response(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Audit(_) => "audit",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: msg.into() })).into_response()
}

fn gate_error_response(e: GateError) -> Response {
    match e {
        GateError::SessionNotFound(_) => error_response(StatusCode::NOT_FOUND, e.to_string()),
        other => {
            error!(error = %other, "gate operation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "GATE_INTERNAL: operation failed")
        }
    }
}
