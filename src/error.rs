//! Error handling for the payment gateway
//!
//! Every domain failure is an [`AppError`] carrying a status code, a stable
//! machine-readable [`ErrorCode`], the gateway acknowledgement code used on the
//! notification channel, and optional diagnostics for operators.

use crate::services::transaction_state::TransactionStatus;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// Machine-readable error codes for client handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
    #[serde(rename = "UNSUPPORTED_PROVIDER")]
    UnsupportedProvider,
    #[serde(rename = "DUPLICATE_ORDER")]
    DuplicateOrder,
    #[serde(rename = "TRANSACTION_NOT_FOUND")]
    TransactionNotFound,
    #[serde(rename = "ILLEGAL_STATE_TRANSITION")]
    IllegalStateTransition,
    #[serde(rename = "BUSINESS_RULE_VIOLATION")]
    BusinessRuleViolation,
    #[serde(rename = "SIGNATURE_MISMATCH")]
    SignatureMismatch,
    #[serde(rename = "AMOUNT_MISMATCH")]
    AmountMismatch,
    #[serde(rename = "TRANSACTION_EXPIRED")]
    TransactionExpired,
    #[serde(rename = "GATEWAY_UNAVAILABLE")]
    GatewayUnavailable,
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
}

/// Acknowledgement codes the gateway expects on server-to-server notifications.
pub mod ack {
    pub const CONFIRMED: &str = "00";
    pub const ORDER_NOT_FOUND: &str = "01";
    pub const ALREADY_PROCESSED: &str = "02";
    pub const INVALID_AMOUNT: &str = "04";
    pub const INVALID_SIGNATURE: &str = "97";
    pub const UNKNOWN_ERROR: &str = "99";
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppErrorKind {
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("unsupported payment provider: {provider}")]
    UnsupportedProvider { provider: String },

    #[error("order {order_id} already exists with status {status}")]
    DuplicateOrder {
        order_id: String,
        status: TransactionStatus,
    },

    #[error("transaction {order_id} not found")]
    NotFound { order_id: String },

    #[error("illegal state transition for {order_id}: {from} -> {to}")]
    IllegalStateTransition {
        order_id: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("business rule violated: {message}")]
    BusinessRule {
        order_id: String,
        status: TransactionStatus,
        message: String,
    },

    #[error("callback signature mismatch for {order_id}")]
    SignatureMismatch {
        order_id: String,
        diagnostics: Option<JsonValue>,
    },

    #[error("amount mismatch for {order_id}: expected {expected}, received {received}")]
    AmountMismatch {
        order_id: String,
        expected: i64,
        received: i64,
    },

    #[error("transaction {order_id} expired")]
    Expired { order_id: String },

    #[error("gateway {provider} unavailable: {message}")]
    GatewayUnavailable { provider: String, message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Unified application error type
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}")]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::new(AppErrorKind::Validation {
            message: message.into(),
            field: field.map(str::to_string),
        })
    }

    pub fn not_found(order_id: impl Into<String>) -> Self {
        Self::new(AppErrorKind::NotFound {
            order_id: order_id.into(),
        })
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Internal {
            message: message.into(),
        })
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Validation { .. } => 400,
            AppErrorKind::UnsupportedProvider { .. } => 400,
            AppErrorKind::DuplicateOrder { .. } => 409,
            AppErrorKind::NotFound { .. } => 404,
            AppErrorKind::IllegalStateTransition { .. } => 409,
            AppErrorKind::BusinessRule { .. } => 422,
            AppErrorKind::SignatureMismatch { .. } => 401,
            AppErrorKind::AmountMismatch { .. } => 400,
            AppErrorKind::Expired { .. } => 410, // Gone
            AppErrorKind::GatewayUnavailable { .. } => 503,
            AppErrorKind::Internal { .. } => 500,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Validation { .. } => ErrorCode::ValidationError,
            AppErrorKind::UnsupportedProvider { .. } => ErrorCode::UnsupportedProvider,
            AppErrorKind::DuplicateOrder { .. } => ErrorCode::DuplicateOrder,
            AppErrorKind::NotFound { .. } => ErrorCode::TransactionNotFound,
            AppErrorKind::IllegalStateTransition { .. } => ErrorCode::IllegalStateTransition,
            AppErrorKind::BusinessRule { .. } => ErrorCode::BusinessRuleViolation,
            AppErrorKind::SignatureMismatch { .. } => ErrorCode::SignatureMismatch,
            AppErrorKind::AmountMismatch { .. } => ErrorCode::AmountMismatch,
            AppErrorKind::Expired { .. } => ErrorCode::TransactionExpired,
            AppErrorKind::GatewayUnavailable { .. } => ErrorCode::GatewayUnavailable,
            AppErrorKind::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Acknowledgement code returned to the gateway on the notification channel
    pub fn ack_code(&self) -> &'static str {
        match &self.kind {
            AppErrorKind::NotFound { .. } => ack::ORDER_NOT_FOUND,
            AppErrorKind::Expired { .. }
            | AppErrorKind::IllegalStateTransition { .. }
            | AppErrorKind::BusinessRule { .. } => ack::ALREADY_PROCESSED,
            AppErrorKind::AmountMismatch { .. } => ack::INVALID_AMOUNT,
            AppErrorKind::SignatureMismatch { .. } => ack::INVALID_SIGNATURE,
            _ => ack::UNKNOWN_ERROR,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Validation { message, .. } => message.clone(),
            AppErrorKind::UnsupportedProvider { provider } => {
                format!("Payment provider '{}' is not supported", provider)
            }
            AppErrorKind::DuplicateOrder { order_id, .. } => {
                format!("Order '{}' already exists", order_id)
            }
            AppErrorKind::NotFound { order_id } => {
                format!("Transaction for order '{}' not found", order_id)
            }
            AppErrorKind::IllegalStateTransition { from, to, .. } => {
                format!("Transaction cannot move from {} to {}", from, to)
            }
            AppErrorKind::BusinessRule { message, .. } => message.clone(),
            AppErrorKind::SignatureMismatch { .. } => "Invalid signature".to_string(),
            AppErrorKind::AmountMismatch { .. } => "Invalid amount".to_string(),
            AppErrorKind::Expired { order_id } => {
                format!("Transaction for order '{}' has expired", order_id)
            }
            AppErrorKind::GatewayUnavailable { .. } => {
                "Payment gateway is temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::Internal { .. } => {
                "An internal server error occurred. Please try again later".to_string()
            }
        }
    }

    /// Structured detail for operators; never contains secrets.
    pub fn diagnostics(&self) -> Option<JsonValue> {
        match &self.kind {
            AppErrorKind::Validation {
                field: Some(field), ..
            } => Some(json!({ "field": field })),
            AppErrorKind::DuplicateOrder { status, .. } => Some(json!({ "status": status })),
            AppErrorKind::IllegalStateTransition { from, to, .. } => {
                Some(json!({ "from": from, "to": to }))
            }
            AppErrorKind::BusinessRule { status, .. } => Some(json!({ "status": status })),
            AppErrorKind::SignatureMismatch { diagnostics, .. } => diagnostics.clone(),
            AppErrorKind::AmountMismatch {
                expected, received, ..
            } => Some(json!({ "expected": expected, "received": received })),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            AppErrorKind::GatewayUnavailable { .. } | AppErrorKind::Internal { .. }
        )
    }
}
