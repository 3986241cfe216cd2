//! HTTP response types and error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::errors::AppError;

/// Envelope for acknowledgements and errors.
///
/// Successful acknowledgements carry `message`; errors carry the error
/// kind in `error` and a human readable `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiResponse {
    pub fn message<S: Into<String>>(message: S) -> Self {
        Self {
            success: true,
            error: None,
            message: Some(message.into()),
        }
    }

    pub fn error(kind: &str, message: String) -> Self {
        Self {
            success: false,
            error: Some(kind.to_string()),
            message: Some(message),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Spawn { .. }
            | AppError::Runtime { .. }
            | AppError::Persistence(_)
            | AppError::Io(_)
            | AppError::Configuration { .. }
            | AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            AppError::Validation { message } => message.clone(),
            AppError::NotFound { resource, id } => format!("{} '{}' not found", resource, id),
            AppError::Persistence(_) => "Database operation failed".to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            debug!("Request rejected: {}", self);
        }

        (status, Json(ApiResponse::error(self.kind(), message))).into_response()
    }
}
