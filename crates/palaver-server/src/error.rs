use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use thiserror::Error;

use palaver_shared::{SessionError, ValidationError};
use palaver_store::StoreError;

use crate::quota::LimitReason;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Authentication required")]
    Authentication,

    #[error("Invalid session: {}", .0.join("; "))]
    SessionInvalid(Vec<String>),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid storage URL: {0}")]
    InvalidUrl(String),

    #[error("Could not extract storage path from URL: {0}")]
    Extraction(String),

    #[error("Storage operation failed at '{path}': {message}")]
    StorageOperation { path: String, message: String },

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Rate limit reached ({reason}) until {period_end}")]
    RateLimited {
        reason: LimitReason,
        period_end: DateTime<Utc>,
    },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Failed to {step}: {message}")]
    DeletionFailed { step: &'static str, message: String },

    #[error("Store error during {context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ServerError {
    pub fn storage(path: impl Into<String>, e: impl std::fmt::Display) -> Self {
        Self::StorageOperation {
            path: path.into(),
            message: e.to_string(),
        }
    }

    /// Attach context to a store error. `NotFound` keeps its meaning.
    pub fn store(context: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| match source {
            StoreError::NotFound => Self::NotFound(format!("{context}: record not found")),
            source => Self::Store { context, source },
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Authentication | Self::SessionInvalid(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) | Self::InvalidUrl(_) | Self::Extraction(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AccessDenied(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::StorageOperation { .. }
            | Self::InvariantViolation(_)
            | Self::DeletionFailed { .. }
            | Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller. Internal failures are logged in full and
    /// reported generically.
    fn public_message(&self) -> String {
        match self {
            Self::StorageOperation { .. } => "Storage operation failed".to_string(),
            Self::InvariantViolation(_) | Self::Store { .. } => {
                "Internal server error".to_string()
            }
            Self::DeletionFailed { step, .. } => format!("Failed to {step}"),
            other => other.to_string(),
        }
    }
}

impl From<ValidationError> for ServerError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<SessionError> for ServerError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Missing => Self::Authentication,
            SessionError::Invalid(issues) => Self::SessionInvalid(issues),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(source: StoreError) -> Self {
        Self::store("database")(source)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let mut body = serde_json::json!({
            "success": false,
            "error": self.public_message(),
        });
        match &self {
            Self::SessionInvalid(issues) => body["issues"] = serde_json::json!(issues),
            Self::RateLimited { reason, period_end } => {
                body["reason"] = serde_json::json!(reason);
                body["periodEnd"] = serde_json::json!(period_end);
            }
            _ => {}
        }

        (status, axum::Json(body)).into_response()
    }
}
