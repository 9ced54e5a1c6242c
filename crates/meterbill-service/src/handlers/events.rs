//! Call event ingest handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use meterbill_core::CallEvent;

use super::parse_tenant;
use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// A call reported by the routing layer.
#[derive(Debug, Deserialize)]
pub struct CallEventRequest {
    /// Tenant that made the call.
    pub tenant_id: String,
    /// Request path.
    pub path: String,
    /// Response time in milliseconds.
    #[serde(default)]
    pub response_time_ms: u64,
    /// HTTP status code returned.
    pub status_code: u16,
    /// Bytes transferred.
    #[serde(default)]
    pub bytes_transferred: u64,
}

impl CallEventRequest {
    fn into_event(self) -> Result<CallEvent, ApiError> {
        Ok(CallEvent {
            tenant_id: parse_tenant(&self.tenant_id)?,
            path: self.path,
            response_time_ms: self.response_time_ms,
            status_code: self.status_code,
            bytes_transferred: self.bytes_transferred,
        })
    }
}

/// Batch of call events.
#[derive(Debug, Deserialize)]
pub struct CallEventBatch {
    /// Events in the batch.
    pub events: Vec<CallEventRequest>,
}

/// Ingest response.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Events queued.
    pub accepted: usize,
    /// Events dropped because the queue was full.
    pub dropped: usize,
}

/// Report a single call.
pub async fn report_call(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(body): Json<CallEventRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let event = body.into_event()?;

    if !state.engine.ingest(event) {
        return Err(ApiError::Unavailable("Ingest queue full".into()));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            accepted: 1,
            dropped: 0,
        }),
    ))
}

/// Report several calls. The batch is validated as a whole before any
/// event is queued.
pub async fn report_calls(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(body): Json<CallEventBatch>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let events = body
        .events
        .into_iter()
        .map(CallEventRequest::into_event)
        .collect::<Result<Vec<_>, _>>()?;

    let total = events.len();
    let accepted = events
        .into_iter()
        .map(|event| state.engine.ingest(event))
        .filter(|queued| *queued)
        .count();

    tracing::debug!(
        service = %auth.service_name,
        accepted,
        dropped = total - accepted,
        "Call batch ingested"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            accepted,
            dropped: total - accepted,
        }),
    ))
}
