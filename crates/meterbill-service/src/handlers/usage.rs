//! Usage query, export and import handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use meterbill_core::{ExportFormat, UsageRecord};

use super::{parse_cycle, parse_tenant};
use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Get a tenant's usage for a cycle.
pub async fn get_usage(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path((tenant, cycle)): Path<(String, String)>,
) -> Result<Json<UsageRecord>, ApiError> {
    let tenant_id = parse_tenant(&tenant)?;
    let cycle = parse_cycle(&cycle)?;

    let record = state
        .engine
        .get_usage(&tenant_id, cycle)?
        .ok_or_else(|| ApiError::NotFound(format!("no usage for {tenant_id} in {cycle}")))?;

    Ok(Json(record))
}

/// Export query parameters.
#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    /// `json` (default) or `csv`.
    pub format: Option<String>,
}

/// Export all of a tenant's usage records.
pub async fn export_usage(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(tenant): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let tenant_id = parse_tenant(&tenant)?;
    let format: ExportFormat = query.format.as_deref().unwrap_or("json").parse()?;

    let body = state.engine.export_usage(&tenant_id, format)?;
    let content_type = match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv",
    };

    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

/// Import response.
#[derive(Debug, Serialize)]
pub struct ImportResponse {
    /// Records written.
    pub imported: usize,
}

/// Import records from a JSON export.
pub async fn import_usage(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    body: String,
) -> Result<Json<ImportResponse>, ApiError> {
    let imported = state.engine.import_usage(&body)?;

    tracing::info!(service = %auth.service_name, imported, "Usage import completed");

    Ok(Json(ImportResponse { imported }))
}
