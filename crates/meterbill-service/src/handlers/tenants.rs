//! Tenant bill and tier handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use meterbill_core::{Bill, TierChangeEvent};

use super::{parse_cycle, parse_tenant};
use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Get a tenant's bill for a cycle.
pub async fn get_bill(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path((tenant, cycle)): Path<(String, String)>,
) -> Result<Json<Bill>, ApiError> {
    let tenant_id = parse_tenant(&tenant)?;
    let cycle = parse_cycle(&cycle)?;

    let bill = state
        .engine
        .get_bill(&tenant_id, cycle)?
        .ok_or_else(|| ApiError::NotFound(format!("no bill for {tenant_id} in {cycle}")))?;

    Ok(Json(bill))
}

/// Tier change request.
#[derive(Debug, Deserialize)]
pub struct ChangeTierRequest {
    /// Target tier name.
    pub tier: String,
}

/// Move a tenant to another tier mid-cycle.
pub async fn change_tier(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Path(tenant): Path<String>,
    Json(body): Json<ChangeTierRequest>,
) -> Result<Json<TierChangeEvent>, ApiError> {
    let tenant_id = parse_tenant(&tenant)?;

    let event = state.engine.change_tier(&tenant_id, &body.tier).await?;

    tracing::info!(
        service = %auth.service_name,
        tenant_id = %tenant_id,
        from = %event.from_tier,
        to = %event.to_tier,
        amount = %event.proration_amount,
        "Tier changed via API"
    );

    Ok(Json(event))
}

/// A tenant's tier change history, oldest first.
pub async fn tier_history(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(tenant): Path<String>,
) -> Result<Json<Vec<TierChangeEvent>>, ApiError> {
    let tenant_id = parse_tenant(&tenant)?;
    Ok(Json(state.engine.tier_history(&tenant_id)?))
}
