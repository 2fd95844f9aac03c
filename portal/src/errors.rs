use crate::table_name::InvalidTableName;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cloud::cloudsql::SqlImportError;
use cloud::object_store::ObjectStoreError;
use cloud::pubsub::PublishError;
use cloud::warehouse::WarehouseError;
use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = PortalError> = std::result::Result<T, E>;

/// Coarse classification of a failure, which decides the HTTP status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthorized,
    Timeout,
    Upstream,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Upstream => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Missing ?{0} parameter.")]
    MissingParameter(&'static str),

    #[error(transparent)]
    InvalidTableName(#[from] InvalidTableName),

    #[error("unsupported file type: {0:?}")]
    UnsupportedFormat(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown report: {0}")]
    UnknownReport(String),

    #[error("row limit must be between 1 and {max}, got {got}")]
    InvalidRowLimit { got: u64, max: u64 },

    #[error("could not read spreadsheet: {0}")]
    Spreadsheet(String),

    #[error("event bucket {got} does not match configured bucket {expected}")]
    BucketMismatch { got: String, expected: String },

    #[error("BigQuery table {0} not found.")]
    TableNotFound(String),

    #[error("no staged upload found for table {0}")]
    NoSourceData(String),

    #[error("File {0} not found in analysis_results folder.")]
    ObjectNotFound(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("authentication required")]
    Unauthorized,

    #[error("warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("sql import error: {0}")]
    SqlImport(#[from] SqlImportError),

    #[error("analysis service error: {0}")]
    AnalysisService(String),

    #[error("csv encoding error: {0}")]
    Csv(#[from] csv::Error),
}

impl PortalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PortalError::MissingParameter(_)
            | PortalError::InvalidTableName(_)
            | PortalError::UnsupportedFormat(_)
            | PortalError::InvalidRequest(_)
            | PortalError::UnknownReport(_)
            | PortalError::InvalidRowLimit { .. }
            | PortalError::Spreadsheet(_)
            | PortalError::BucketMismatch { .. } => ErrorKind::Validation,

            PortalError::TableNotFound(_)
            | PortalError::NoSourceData(_)
            | PortalError::ObjectNotFound(_)
            | PortalError::NotConfigured(_)
            | PortalError::ObjectStore(ObjectStoreError::NotFound(_)) => ErrorKind::NotFound,

            PortalError::Unauthorized => ErrorKind::Unauthorized,

            PortalError::Warehouse(e) if e.is_retryable() => ErrorKind::Timeout,

            PortalError::Warehouse(_)
            | PortalError::ObjectStore(_)
            | PortalError::Publish(_)
            | PortalError::SqlImport(_)
            | PortalError::AnalysisService(_)
            | PortalError::Csv(_) => ErrorKind::Upstream,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
}

impl IntoResponse for PortalError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        match kind {
            ErrorKind::Upstream => tracing::error!(error = %self, "request failed"),
            ErrorKind::Timeout => tracing::warn!(error = %self, "request timed out"),
            _ => tracing::debug!(error = %self, "request rejected"),
        }

        let body = Json(ErrorBody {
            success: false,
            error: self.to_string(),
            retryable: self.is_retryable().then_some(true),
        });

        (kind.status(), body).into_response()
    }
}
