use crate::payments::error::PaymentError;
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;

/// Raw callback parameters exactly as the gateway delivered them.
pub type CallbackParams = HashMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderName {
    Vnpay,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Vnpay => "VNPAY",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "vnpay" | "vn_pay" | "vn-pay" => Ok(ProviderName::Vnpay),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

const MAX_FRACTION_DIGITS: i64 = 2;
/// Largest power of ten accepted in exponent notation; the i64 minor-unit
/// encoding overflows well before this anyway.
const MAX_INTEGER_EXPONENT: i64 = 18;

/// Amount must be strictly positive with at most two fractional digits.
///
/// The exponent is bounded before any arithmetic so inputs like `1e-100000000`
/// are rejected without materialising a huge power of ten.
pub fn validate_amount(amount: &BigDecimal) -> Result<(), PaymentError> {
    let (_, scale) = amount.normalized().as_bigint_and_exponent();
    if scale > MAX_FRACTION_DIGITS {
        return Err(PaymentError::validation(
            "amount has more than two decimal places",
            "amount",
        ));
    }
    if scale < -MAX_INTEGER_EXPONENT {
        return Err(PaymentError::validation("amount is out of range", "amount"));
    }
    if *amount <= BigDecimal::from(0) {
        return Err(PaymentError::validation(
            "amount must be greater than zero",
            "amount",
        ));
    }
    Ok(())
}

/// Converts an amount to the gateway's integer minor-unit encoding (x100).
pub fn to_minor_units(amount: &BigDecimal) -> Result<i64, PaymentError> {
    validate_amount(amount)?;
    (amount.clone() * BigDecimal::from(100))
        .to_i64()
        .ok_or_else(|| PaymentError::validation(format!("amount {} is out of range", amount), "amount"))
}

/// Outcome the gateway reports for an outbound call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Processing,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: String,
    pub amount: BigDecimal,
    pub order_info: String,
    pub created_at: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub status: PaymentState,
    pub redirect_url: Option<String>,
    pub provider_reference: Option<String>,
    pub provider_data: Option<JsonValue>,
}

/// Which delivery path a callback arrived on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackChannel {
    Return,
    Notification,
}

impl CallbackChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackChannel::Return => "return",
            CallbackChannel::Notification => "notification",
        }
    }
}

/// Gateway-neutral view of the callback fields the orchestrator acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPayload {
    pub order_id: String,
    pub response_code: String,
    pub secure_hash: String,
    pub provider_reference: Option<String>,
    pub amount_minor: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookVerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
    /// Operator-facing detail on failure. Never carries key material.
    pub diagnostics: Option<JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_name_parses_case_insensitively() {
        assert_eq!(ProviderName::from_str("VNPAY").unwrap(), ProviderName::Vnpay);
        assert_eq!(ProviderName::from_str(" vnpay ").unwrap(), ProviderName::Vnpay);
        assert!(ProviderName::from_str("momo").is_err());
    }

    #[test]
    fn provider_name_serializes_upper_case() {
        let json = serde_json::to_string(&ProviderName::Vnpay).unwrap();
        assert_eq!(json, "\"VNPAY\"");
    }

    #[test]
    fn amount_validation_rejects_zero_negative_and_sub_cent() {
        assert!(validate_amount(&BigDecimal::from(0)).is_err());
        assert!(validate_amount(&BigDecimal::from(-5)).is_err());
        assert!(validate_amount(&BigDecimal::from_str("10.001").unwrap()).is_err());
        assert!(validate_amount(&BigDecimal::from_str("10.25").unwrap()).is_ok());
        assert!(validate_amount(&BigDecimal::from_str("10.2500").unwrap()).is_ok());
        assert!(validate_amount(&BigDecimal::from_str("1.5e1").unwrap()).is_ok());
    }

    #[test]
    fn amount_validation_bounds_exponent_before_arithmetic() {
        let tiny = BigDecimal::from_str("1e-100000000").unwrap();
        let err = validate_amount(&tiny).unwrap_err();
        assert!(err.to_string().contains("two decimal places"));

        let huge = BigDecimal::from_str("1e100000000").unwrap();
        let err = validate_amount(&huge).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        assert!(validate_amount(&BigDecimal::from_str("-1e-100000000").unwrap()).is_err());
        assert!(validate_amount(&BigDecimal::from_str("1E+3").unwrap()).is_ok());
    }

    #[test]
    fn minor_units_are_amount_times_hundred() {
        assert_eq!(to_minor_units(&BigDecimal::from(100000)).unwrap(), 10_000_000);
        assert_eq!(
            to_minor_units(&BigDecimal::from_str("12.50").unwrap()).unwrap(),
            1250
        );
    }
}
