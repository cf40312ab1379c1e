use crate::config::{env_or, required_env, ConfigError};
use crate::logging::MaskedSecret;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::signature::{
    SignatureCodec, SECURE_HASH_FIELD, SECURE_HASH_TYPE_FIELD,
};
use crate::payments::types::{
    to_minor_units, CallbackParams, CallbackPayload, PaymentRequest, PaymentResponse,
    PaymentState, ProviderName, WebhookVerificationResult,
};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const SANDBOX_URL: &str = "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html";
const DATE_FORMAT: &str = "%Y%m%d%H%M%S";
/// VNPay timestamps are Indochina time (GMT+7).
const GATEWAY_UTC_OFFSET_SECS: i32 = 7 * 3600;
const MAX_EXPIRY_MINUTES: i64 = 15;
const APPROVED: &str = "00";

#[derive(Debug, Clone)]
pub struct VnPayConfig {
    pub tmn_code: String,
    pub hash_secret: MaskedSecret,
    pub base_url: String,
    pub return_url: String,
    pub version: String,
    pub locale: String,
    pub order_type: String,
    pub ip_addr: String,
    pub expiry_minutes: i64,
}

impl Default for VnPayConfig {
    fn default() -> Self {
        Self {
            tmn_code: String::new(),
            hash_secret: MaskedSecret::new(""),
            base_url: SANDBOX_URL.to_string(),
            return_url: "http://localhost:8000/api/payments/vnpay/return".to_string(),
            version: "2.1.0".to_string(),
            locale: "vn".to_string(),
            order_type: "other".to_string(),
            ip_addr: "127.0.0.1".to_string(),
            expiry_minutes: MAX_EXPIRY_MINUTES,
        }
    }
}

impl VnPayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            tmn_code: required_env("VNPAY_TMN_CODE")?,
            hash_secret: MaskedSecret::new(required_env("VNPAY_HASH_SECRET")?),
            base_url: std::env::var("VNPAY_BASE_URL").unwrap_or(defaults.base_url),
            return_url: std::env::var("VNPAY_RETURN_URL").unwrap_or(defaults.return_url),
            version: std::env::var("VNPAY_VERSION").unwrap_or(defaults.version),
            locale: std::env::var("VNPAY_LOCALE").unwrap_or(defaults.locale),
            order_type: std::env::var("VNPAY_ORDER_TYPE").unwrap_or(defaults.order_type),
            ip_addr: std::env::var("VNPAY_IP_ADDR").unwrap_or(defaults.ip_addr),
            expiry_minutes: env_or("VNPAY_EXPIRY_MINUTES", defaults.expiry_minutes)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tmn_code.trim().is_empty() {
            return Err(ConfigError::MissingVariable("VNPAY_TMN_CODE".to_string()));
        }
        if self.hash_secret.is_empty() {
            return Err(ConfigError::MissingVariable("VNPAY_HASH_SECRET".to_string()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "VNPAY_BASE_URL must be a valid URL".to_string(),
            ));
        }
        if !(1..=MAX_EXPIRY_MINUTES).contains(&self.expiry_minutes) {
            return Err(ConfigError::ValidationFailed(format!(
                "VNPAY_EXPIRY_MINUTES must be between 1 and {}, got {}",
                MAX_EXPIRY_MINUTES, self.expiry_minutes
            )));
        }
        Ok(())
    }
}

pub struct VnPayProvider {
    config: VnPayConfig,
    codec: SignatureCodec,
}

impl VnPayProvider {
    pub fn new(config: VnPayConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            tmn_code = %config.tmn_code,
            hash_secret = %config.hash_secret,
            base_url = %config.base_url,
            expiry_minutes = config.expiry_minutes,
            "VNPay provider configured"
        );
        let codec = SignatureCodec::new(config.hash_secret.clone());
        Ok(Self { config, codec })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(VnPayConfig::from_env()?)
    }

    fn gateway_time(at: DateTime<Utc>) -> PaymentResult<String> {
        let offset = FixedOffset::east_opt(GATEWAY_UTC_OFFSET_SECS).ok_or_else(|| {
            PaymentError::ProviderError {
                provider: ProviderName::Vnpay.to_string(),
                message: "invalid gateway timezone offset".to_string(),
                provider_code: None,
                retryable: false,
            }
        })?;
        Ok(at.with_timezone(&offset).format(DATE_FORMAT).to_string())
    }

    fn payment_params(&self, request: &PaymentRequest) -> PaymentResult<HashMap<String, String>> {
        let amount = to_minor_units(&request.amount)?;
        let mut params = HashMap::new();
        let mut put = |k: &str, v: String| {
            params.insert(k.to_string(), v);
        };
        put("vnp_Version", self.config.version.clone());
        put("vnp_Command", "pay".to_string());
        put("vnp_TmnCode", self.config.tmn_code.clone());
        put("vnp_Locale", self.config.locale.clone());
        put("vnp_CurrCode", "VND".to_string());
        put("vnp_TxnRef", request.order_id.clone());
        put("vnp_OrderInfo", request.order_info.clone());
        put("vnp_OrderType", self.config.order_type.clone());
        put("vnp_Amount", amount.to_string());
        put("vnp_ReturnUrl", self.config.return_url.clone());
        put("vnp_IpAddr", self.config.ip_addr.clone());
        put("vnp_CreateDate", Self::gateway_time(request.created_at)?);
        put("vnp_ExpireDate", Self::gateway_time(request.expiry_time)?);
        Ok(params)
    }
}

#[async_trait]
impl PaymentProvider for VnPayProvider {
    async fn initiate_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentResponse> {
        if request.order_id.trim().is_empty() {
            return Err(PaymentError::validation("order id is required", "orderId"));
        }
        let params = self.payment_params(&request)?;
        let query = SignatureCodec::canonicalize(&params);
        let secure_hash = self.codec.sign(&params)?;
        let redirect_url = format!(
            "{}?{}&{}={}",
            self.config.base_url, query, SECURE_HASH_FIELD, secure_hash
        );

        debug!(order_id = %request.order_id, "VNPay redirect URL signed");

        Ok(PaymentResponse {
            status: PaymentState::Pending,
            redirect_url: Some(redirect_url),
            provider_reference: None,
            provider_data: Some(json!({
                "createDate": params.get("vnp_CreateDate"),
                "expireDate": params.get("vnp_ExpireDate"),
            })),
        })
    }

    fn name(&self) -> ProviderName {
        ProviderName::Vnpay
    }

    fn payment_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.config.expiry_minutes)
    }

    fn success_code(&self) -> &'static str {
        APPROVED
    }

    fn verify_callback(&self, params: &CallbackParams) -> WebhookVerificationResult {
        let received = params
            .get(SECURE_HASH_FIELD)
            .map(String::as_str)
            .unwrap_or_default();
        if self.codec.verify(params, received) {
            return WebhookVerificationResult {
                valid: true,
                reason: None,
                diagnostics: None,
            };
        }

        let prefix: String = received.chars().take(8).collect();
        // Masked key goes to the log only, never to the caller.
        warn!(
            order_id = ?params.get("vnp_TxnRef"),
            received_hash_prefix = %prefix,
            secret = %self.codec.masked_secret(),
            "VNPay secure hash mismatch"
        );
        WebhookVerificationResult {
            valid: false,
            reason: Some("invalid VNPay secure hash".to_string()),
            diagnostics: Some(json!({
                "orderId": params.get("vnp_TxnRef"),
                "signData": SignatureCodec::canonicalize(params),
                "receivedHashPrefix": prefix,
                "hashType": params.get(SECURE_HASH_TYPE_FIELD),
            })),
        }
    }

    fn parse_callback(&self, params: &CallbackParams) -> PaymentResult<CallbackPayload> {
        let required = |key: &str| -> PaymentResult<String> {
            params
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    PaymentError::validation(format!("missing required parameter {}", key), key)
                })
        };

        let secure_hash = required(SECURE_HASH_FIELD)?;
        let order_id = required("vnp_TxnRef")?;
        let response_code = required("vnp_ResponseCode")?;

        let amount_minor = match params.get("vnp_Amount").map(|v| v.trim()) {
            Some(raw) if !raw.is_empty() => Some(raw.parse::<i64>().map_err(|_| {
                PaymentError::validation(format!("invalid vnp_Amount: {}", raw), "vnp_Amount")
            })?),
            _ => None,
        };

        let provider_reference = params
            .get("vnp_TransactionNo")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty() && v != "0");

        Ok(CallbackPayload {
            order_id,
            response_code,
            secure_hash,
            provider_reference,
            amount_minor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::TimeZone;

    const SECRET: &str = "TESTSECRETKEY1234567890ABCDEFGHI";
    const REFERENCE_HASH: &str = "5b215d90f0e88627affb0904c5354aa5f12d4077e8a50cd7ef7ca9676d247216d42e4f16f2cfe1326e0ac5543652fddb8e1089cb9539aadc6085fcbb856cd3a0";

    fn config() -> VnPayConfig {
        VnPayConfig {
            tmn_code: "TESTTMN1".to_string(),
            hash_secret: MaskedSecret::new(SECRET),
            ..VnPayConfig::default()
        }
    }

    fn provider() -> VnPayProvider {
        VnPayProvider::new(config()).expect("provider init should succeed")
    }

    fn reference_callback() -> CallbackParams {
        [
            ("vnp_TxnRef", "ORD1"),
            ("vnp_TmnCode", "TESTTMN1"),
            ("vnp_Amount", "10000000"),
            ("vnp_BankCode", "NCB"),
            ("vnp_OrderInfo", "Payment for order ORD1"),
            ("vnp_ResponseCode", "00"),
            ("vnp_TransactionNo", "14000001"),
            ("vnp_PayDate", "20260101103000"),
            ("vnp_TransactionStatus", "00"),
            ("vnp_SecureHashType", "HmacSHA512"),
            ("vnp_SecureHash", REFERENCE_HASH),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn config_rejects_expiry_outside_window() {
        let mut cfg = config();
        cfg.expiry_minutes = 0;
        assert!(cfg.validate().is_err());
        cfg.expiry_minutes = 16;
        assert!(cfg.validate().is_err());
        cfg.expiry_minutes = 15;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_requires_credentials() {
        let cfg = VnPayConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingVariable(_))));
    }

    #[test]
    fn gateway_time_is_gmt_plus_seven() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 3, 30, 0).unwrap();
        assert_eq!(VnPayProvider::gateway_time(at).unwrap(), "20260101103000");
    }

    #[tokio::test]
    async fn redirect_url_is_signed_and_verifiable() {
        let provider = provider();
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 3, 30, 0).unwrap();
        let response = provider
            .initiate_payment(PaymentRequest {
                order_id: "ORD1".to_string(),
                amount: BigDecimal::from(100000),
                order_info: "Payment for order ORD1".to_string(),
                created_at: created,
                expiry_time: created + chrono::Duration::minutes(15),
            })
            .await
            .unwrap();

        assert_eq!(response.status, PaymentState::Pending);
        let redirect = response.redirect_url.unwrap();
        assert!(redirect.starts_with(SANDBOX_URL));

        let parsed = url::Url::parse(&redirect).unwrap();
        let params: CallbackParams = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["vnp_Amount"], "10000000");
        assert_eq!(params["vnp_Command"], "pay");
        assert_eq!(params["vnp_CurrCode"], "VND");
        assert_eq!(params["vnp_TxnRef"], "ORD1");
        assert_eq!(params["vnp_CreateDate"], "20260101103000");
        assert_eq!(params["vnp_ExpireDate"], "20260101104500");
        assert_eq!(params["vnp_OrderInfo"], "Payment for order ORD1");

        let verification = provider.verify_callback(&params);
        assert!(verification.valid);
    }

    #[tokio::test]
    async fn initiate_rejects_sub_minor_unit_amount() {
        let now = Utc::now();
        let result = provider()
            .initiate_payment(PaymentRequest {
                order_id: "ORD2".to_string(),
                amount: "10.005".parse().unwrap(),
                order_info: "Payment for order ORD2".to_string(),
                created_at: now,
                expiry_time: now + chrono::Duration::minutes(15),
            })
            .await;
        assert!(matches!(result, Err(PaymentError::ValidationError { .. })));
    }

    #[test]
    fn reference_callback_verifies() {
        assert!(provider().verify_callback(&reference_callback()).valid);
    }

    #[test]
    fn forged_callback_diagnostics_omit_key_material() {
        let mut params = reference_callback();
        params.insert("vnp_ResponseCode".to_string(), "24".to_string());

        let result = provider().verify_callback(&params);
        assert!(!result.valid);
        let diagnostics = result.diagnostics.unwrap().to_string();
        assert!(!diagnostics.contains("TE****HI"));
        assert!(!diagnostics.contains(SECRET));
        assert!(!diagnostics.contains("secret"));
        assert!(diagnostics.contains("5b215d90"));
        assert!(!diagnostics.contains(REFERENCE_HASH));
    }

    #[test]
    fn parse_callback_extracts_fields() {
        let payload = provider().parse_callback(&reference_callback()).unwrap();
        assert_eq!(payload.order_id, "ORD1");
        assert_eq!(payload.response_code, "00");
        assert_eq!(payload.provider_reference.as_deref(), Some("14000001"));
        assert_eq!(payload.amount_minor, Some(10_000_000));
    }

    #[test]
    fn parse_callback_requires_signature_reference_and_code() {
        for key in ["vnp_SecureHash", "vnp_TxnRef", "vnp_ResponseCode"] {
            let mut params = reference_callback();
            params.remove(key);
            let err = provider().parse_callback(&params).unwrap_err();
            assert!(
                matches!(err, PaymentError::ValidationError { ref field, .. } if field.as_deref() == Some(key))
            );
        }
    }

    #[test]
    fn parse_callback_rejects_non_numeric_amount() {
        let mut params = reference_callback();
        params.insert("vnp_Amount".to_string(), "ten".to_string());
        assert!(provider().parse_callback(&params).is_err());
    }
}
