//! Billing run handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use meterbill_core::{Bill, RunSummary};

use super::{parse_cycle, parse_tenant};
use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Summary of the last completed monthly run.
pub async fn last_run(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
) -> Result<Json<RunSummary>, ApiError> {
    let summary = state
        .engine
        .last_run_summary()?
        .ok_or_else(|| ApiError::NotFound("no billing run has completed".into()))?;

    Ok(Json(summary))
}

/// Bill a cycle now. Returns 409 while another run holds the lease and 400
/// for a cycle that has not ended.
pub async fn run_cycle(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Path(cycle): Path<String>,
) -> Result<Json<RunSummary>, ApiError> {
    let cycle = parse_cycle(&cycle)?;

    tracing::info!(service = %auth.service_name, cycle = %cycle, "Manual billing run requested");

    Ok(Json(state.engine.run_monthly(cycle).await?))
}

/// Retry settlement of one unpaid bill.
pub async fn retry_bill(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path((tenant, cycle)): Path<(String, String)>,
) -> Result<Json<Bill>, ApiError> {
    let tenant_id = parse_tenant(&tenant)?;
    let cycle = parse_cycle(&cycle)?;

    Ok(Json(state.engine.retry_bill(&tenant_id, cycle).await?))
}
