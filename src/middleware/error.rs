//! Response envelope and error response formatting
//!
//! Every response, success or failure, is a `ResponseObject` with the HTTP
//! status mirrored in `statusCode`. Errors carry a machine-readable code and
//! optional diagnostics in `data`.

use crate::error::{AppError, ErrorCode};
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Standard response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseObject<T> {
    pub status_code: u16,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> ResponseObject<T> {
    pub fn new(status: StatusCode, message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            status_code: status.as_u16(),
            message: message.into(),
            data,
        }
    }

    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self::new(StatusCode::OK, message, Some(data))
    }
}

impl<T: Serialize> IntoResponse for ResponseObject<T> {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// `data` payload of an error envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    /// Machine-readable error code
    pub error: ErrorCode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,

    pub retryable: bool,

    pub request_id: Option<String>,

    /// ISO 8601 timestamp of the error
    pub timestamp: String,
}

impl ErrorDetails {
    pub fn from_app_error(error: &AppError) -> Self {
        Self {
            error: error.error_code(),
            details: error.diagnostics(),
            retryable: error.is_retryable(),
            request_id: error.request_id.clone(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status_code.is_server_error() {
            tracing::error!(
                error = %self,
                request_id = ?self.request_id,
                context = ?self.context,
                status = status_code.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = %self,
                request_id = ?self.request_id,
                status = status_code.as_u16(),
                "Client error occurred"
            );
        }

        ResponseObject::new(
            status_code,
            self.user_message(),
            Some(ErrorDetails::from_app_error(&self)),
        )
        .into_response()
    }
}

/// Helper to extract request ID from request headers
pub fn get_request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
