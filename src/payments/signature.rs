//! Callback and redirect-URL signing for gateways that authenticate with
//! HMAC-SHA512 over a canonical parameter string.
//!
//! There is exactly one canonical form. It is used both to sign the outbound
//! redirect URL and to verify inbound callbacks:
//!
//! * only keys in the gateway namespace (`vnp_`) take part,
//! * `vnp_SecureHash` / `vnp_SecureHashType` and empty values are skipped,
//! * keys are ordered case-insensitively (raw key breaks ties),
//! * keys and values are `application/x-www-form-urlencoded` (space becomes `+`),
//! * pairs are joined with `&`.

use crate::logging::MaskedSecret;
use crate::payments::error::PaymentResult;
use crate::payments::utils::{hmac_sha512_hex, secure_eq};
use url::form_urlencoded::byte_serialize;

pub const PARAM_PREFIX: &str = "vnp_";
pub const SECURE_HASH_FIELD: &str = "vnp_SecureHash";
pub const SECURE_HASH_TYPE_FIELD: &str = "vnp_SecureHashType";

#[derive(Debug, Clone)]
pub struct SignatureCodec {
    secret: MaskedSecret,
}

impl SignatureCodec {
    pub fn new(secret: MaskedSecret) -> Self {
        Self { secret }
    }

    /// Builds the canonical string. Also the query string of the signed URL.
    pub fn canonicalize<'a, I>(params: I) -> String
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut fields: Vec<(&str, &str)> = params
            .into_iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .filter(|(k, v)| is_signed_field(k) && !v.is_empty())
            .collect();

        fields.sort_by(|a, b| {
            a.0.to_lowercase()
                .cmp(&b.0.to_lowercase())
                .then_with(|| a.0.cmp(b.0))
        });

        fields
            .iter()
            .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn sign<'a, I>(&self, params: I) -> PaymentResult<String>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let data = Self::canonicalize(params);
        hmac_sha512_hex(self.secret.expose().as_bytes(), data.as_bytes())
    }

    /// Fails closed: an empty signature or any signing failure is a mismatch.
    pub fn verify<'a, I>(&self, params: I, received_signature: &str) -> bool
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let received = received_signature.trim().to_lowercase();
        if received.is_empty() {
            return false;
        }
        match self.sign(params) {
            Ok(computed) => secure_eq(computed.as_bytes(), received.as_bytes()),
            Err(_) => false,
        }
    }

    pub fn masked_secret(&self) -> String {
        self.secret.masked()
    }
}

fn is_signed_field(key: &str) -> bool {
    key.starts_with(PARAM_PREFIX) && key != SECURE_HASH_FIELD && key != SECURE_HASH_TYPE_FIELD
}

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SECRET: &str = "TESTSECRETKEY1234567890ABCDEFGHI";
    const EXPECTED_DATA: &str = "vnp_Amount=10000000&vnp_BankCode=NCB&vnp_OrderInfo=Payment+for+order+ORD1&vnp_PayDate=20260101103000&vnp_ResponseCode=00&vnp_TmnCode=TESTTMN1&vnp_TransactionNo=14000001&vnp_TransactionStatus=00&vnp_TxnRef=ORD1";
    const EXPECTED_HASH: &str = "5b215d90f0e88627affb0904c5354aa5f12d4077e8a50cd7ef7ca9676d247216d42e4f16f2cfe1326e0ac5543652fddb8e1089cb9539aadc6085fcbb856cd3a0";

    fn codec() -> SignatureCodec {
        SignatureCodec::new(MaskedSecret::new(SECRET))
    }

    fn callback_params() -> HashMap<String, String> {
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
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn canonical_string_matches_reference_vector() {
        let mut params = callback_params();
        params.insert(SECURE_HASH_FIELD.to_string(), "ignored".to_string());
        params.insert(SECURE_HASH_TYPE_FIELD.to_string(), "HmacSHA512".to_string());
        params.insert("vnp_CardType".to_string(), String::new());
        params.insert("utm_source".to_string(), "mail".to_string());

        assert_eq!(SignatureCodec::canonicalize(&params), EXPECTED_DATA);
    }

    #[test]
    fn sign_matches_reference_vector() {
        let signature = codec().sign(&callback_params()).unwrap();
        assert_eq!(signature, EXPECTED_HASH);
    }

    #[test]
    fn verify_accepts_reference_hash_in_either_case() {
        let params = callback_params();
        assert!(codec().verify(&params, EXPECTED_HASH));
        assert!(codec().verify(&params, &EXPECTED_HASH.to_uppercase()));
    }

    #[test]
    fn verify_rejects_single_character_flip() {
        let params = callback_params();
        let mut tampered = EXPECTED_HASH.to_string();
        tampered.replace_range(0..1, "6");
        assert!(!codec().verify(&params, &tampered));
    }

    #[test]
    fn verify_rejects_tampered_parameter() {
        let mut params = callback_params();
        params.insert("vnp_Amount".to_string(), "99999900".to_string());
        assert!(!codec().verify(&params, EXPECTED_HASH));
    }

    #[test]
    fn verify_fails_closed_on_empty_signature() {
        assert!(!codec().verify(&callback_params(), ""));
        assert!(!codec().verify(&callback_params(), "   "));
    }

    #[test]
    fn ordering_is_case_insensitive() {
        let params: HashMap<String, String> = [("vnp_b", "2"), ("vnp_A", "1"), ("vnp_C", "3")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(SignatureCodec::canonicalize(&params), "vnp_A=1&vnp_b=2&vnp_C=3");
    }

    #[test]
    fn round_trip_holds_for_reserved_characters() {
        let params: HashMap<String, String> = [
            ("vnp_OrderInfo", "Thanh toan don hang #12 & phi=0"),
            ("vnp_ReturnUrl", "https://shop.example/return?x=1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let signature = codec().sign(&params).unwrap();
        assert!(codec().verify(&params, &signature));
    }

    #[test]
    fn debug_output_never_contains_secret() {
        let rendered = format!("{:?}", codec());
        assert!(!rendered.contains(SECRET));
        assert_eq!(codec().masked_secret(), "TE****HI");
    }
}
