//! Engine and API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use meterbill_core::{BillingError, TenantId};
use meterbill_store::StoreError;

use crate::analytics::AnalyticsError;
use crate::collab::{DirectoryError, GatewayError};
use crate::payments::PaymentError;

/// Errors returned by the metering engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Domain rule violated.
    #[error(transparent)]
    Billing(#[from] BillingError),

    /// Storage failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Payment gateway failed.
    #[error("payment error: {0}")]
    Payment(#[from] PaymentError),

    /// Subscription directory failed.
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Tenant is not known to the directory.
    #[error("tenant not found: {0}")]
    TenantNotFound(TenantId),

    /// Requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another run holds the monthly run lease.
    #[error("billing run already in progress (owner {owner})")]
    AlreadyRunning {
        /// Instance holding the lease.
        owner: String,
    },

    /// The engine was started twice.
    #[error("scheduler start failed: {0}")]
    SchedulerStart(String),
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        Self::Payment(PaymentError::Gateway(err))
    }
}

impl From<AnalyticsError> for EngineError {
    fn from(err: AnalyticsError) -> Self {
        match err {
            AnalyticsError::Store(e) => Self::Store(e),
            AnalyticsError::Directory(e) => Self::Directory(e),
        }
    }
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - invalid state transition or run in progress.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Ingest queue is full.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// External service error.
    #[error("external service error: {0}")]
    ExternalService(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", self.to_string()),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            Self::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                msg.clone(),
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            Self::ExternalService(msg) => (
                StatusCode::BAD_GATEWAY,
                "external_service_error",
                msg.clone(),
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound("record not found".into()),
            StoreError::Database(msg) | StoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::TierNotFound { .. } => Self::NotFound(err.to_string()),
            BillingError::InvalidTierChange { .. } | BillingError::InvalidBillTransition { .. } => {
                Self::Conflict(err.to_string())
            }
            BillingError::InvalidEndpointRule { .. }
            | BillingError::InvalidCycle(_)
            | BillingError::InvalidId(_)
            | BillingError::Serialization(_)
            | BillingError::UnsupportedFormat(_) => Self::BadRequest(err.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Billing(e) => e.into(),
            EngineError::Store(e) => e.into(),
            EngineError::TenantNotFound(id) => Self::NotFound(format!("tenant not found: {id}")),
            EngineError::NotFound(what) => Self::NotFound(what),
            EngineError::AlreadyRunning { .. } => Self::Conflict(err.to_string()),
            EngineError::Payment(e) => Self::ExternalService(e.to_string()),
            EngineError::Directory(e) => Self::ExternalService(e.to_string()),
            EngineError::SchedulerStart(msg) => Self::Internal(msg),
        }
    }
}
