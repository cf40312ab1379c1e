use crate::payments::error::PaymentResult;
use crate::payments::types::{
    to_minor_units, CallbackParams, CallbackPayload, PaymentRequest, PaymentResponse,
    ProviderName, WebhookVerificationResult,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;

/// Contract every gateway client fulfils.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Produces the signed redirect URL for a new payment.
    async fn initiate_payment(&self, request: PaymentRequest) -> PaymentResult<PaymentResponse>;

    fn name(&self) -> ProviderName;

    /// How long a pending payment stays payable.
    fn payment_window(&self) -> chrono::Duration;

    /// Response code that means the gateway approved the payment.
    fn success_code(&self) -> &'static str;

    fn amount_in_minor_units(&self, amount: &BigDecimal) -> PaymentResult<i64> {
        to_minor_units(amount)
    }

    /// Checks the callback signature. Never errors: anything unverifiable is invalid.
    fn verify_callback(&self, params: &CallbackParams) -> WebhookVerificationResult;

    fn parse_callback(&self, params: &CallbackParams) -> PaymentResult<CallbackPayload>;
}
