//! Request and response types for the vg-daemon HTTP endpoints.
//!
//! Gate results (`Outcome`, `GateStatus`, `Ack`) are serialized as-is from
//! vg-gate; only envelopes specific to HTTP live here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vg_gate::{SessionId, SessionState};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub config_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// POST /v1/sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub subject_id: String,
    /// Opaque identity-provider context, stored with the session.
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreatedResponse {
    pub session_id: SessionId,
    pub state: SessionState,
    pub current_stage_order: u32,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// POST /v1/sessions/:id/submit
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub factor_id: String,
    pub secret: String,
}

impl std::fmt::Debug for SubmitRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitRequest")
            .field("factor_id", &self.factor_id)
            .field("secret", &"<REDACTED>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Body for 4xx/5xx responses that are not gate outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
