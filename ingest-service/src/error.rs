/// Error types for the ingestion service.
///
/// Errors are converted to the HTTP responses of the admission contract:
/// validation problems carry a field error map, idempotency conflicts map to
/// 409, everything else to 500.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use event_store::StoreError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

pub type Result<T> = std::result::Result<T, AppError>;

/// Field name -> rejection messages.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn messages(&self, field: &str) -> &[String] {
        self.0.get(field).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug)]
pub enum AppError {
    /// Field-level rejection of the request
    Validation(FieldErrors),

    /// Unresolvable idempotency conflict
    Conflict,

    /// Transient storage failure or unexpected internal error
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(fields) => write!(f, "validation failed: {fields:?}"),
            AppError::Conflict => write!(f, "idempotency conflict"),
            AppError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            AppError::Validation(fields) => {
                HttpResponse::BadRequest().json(serde_json::json!({
                    "error": "validation failed",
                    "fields": fields,
                }))
            }
            AppError::Conflict => HttpResponse::Conflict().finish(),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                HttpResponse::InternalServerError().finish()
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        if err.is_conflict() {
            AppError::Conflict
        } else {
            AppError::Internal(err.to_string())
        }
    }
}
