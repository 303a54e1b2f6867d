//! Error types for the pipeline, query path and HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;
use vector_ingest::{IngestError, InvalidTransition};

/// Errors from the persistence layer
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid dataset record: {0}")]
    InvalidRecord(String),

    #[error("archive store error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// The statement referenced a table that does not exist
    pub fn is_missing_table(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(e)) => e.code().as_deref() == Some("42P01"),
            _ => false,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Errors surfaced by pipeline and query operations
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("Invalid bbox: {0}")]
    InvalidBBox(String),

    #[error("Spatial data is not available for dataset {0}")]
    NotActivated(String),

    #[error("The original archive for dataset {0} is no longer available")]
    SourceUnavailable(String),

    #[error("Dataset {0} is already being processed")]
    AlreadyProcessing(String),

    #[error("Vector processing is disabled")]
    Disabled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VectorError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ingest(e) => e.kind(),
            Self::InvalidBBox(_) => "invalid_bbox",
            Self::NotActivated(_) => "not_activated",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::AlreadyProcessing(_) => "already_processing",
            Self::Disabled => "disabled",
            Self::Store(_) => "database",
            Self::Transition(_) | Self::Internal(_) => "internal",
        }
    }

    /// Infrastructure failures, as opposed to caller or data conditions
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::Ingest(e) => !e.is_validation(),
            Self::Store(_) | Self::Transition(_) | Self::Internal(_) => true,
            _ => false,
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidBBox(_) => StatusCode::BAD_REQUEST,
            Self::NotActivated(_) | Self::SourceUnavailable(_) => StatusCode::NOT_FOUND,
            Self::AlreadyProcessing(_) => StatusCode::CONFLICT,
            Self::Disabled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Ingest(IngestError::Cancelled) => StatusCode::CONFLICT,
            Self::Ingest(IngestError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            e if e.is_infrastructure() => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// Message safe to show to the caller
    pub fn public_message(&self) -> String {
        if self.is_infrastructure() {
            "Internal error while processing spatial data".to_string()
        } else {
            self.to_string()
        }
    }
}

impl IntoResponse for VectorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_infrastructure() {
            error!(error = %self, code = self.code(), "Request failed");
        }
        let body = ErrorResponse {
            error: self.public_message(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for pipeline and query operations.
pub type VectorResult<T> = std::result::Result<T, VectorError>;
