//! Revenue analytics handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use meterbill_core::{RevenueSnapshot, Segmentation};

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Current revenue metrics.
pub async fn revenue(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
) -> Result<Json<RevenueSnapshot>, ApiError> {
    Ok(Json(state.engine.get_revenue_snapshot()?))
}

/// Tenant segmentation for the current cycle.
pub async fn segmentation(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
) -> Result<Json<Segmentation>, ApiError> {
    Ok(Json(state.engine.get_segmentation().await?))
}
