use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{AppState, TransactionView};
use crate::error::{ack, AppError};
use crate::middleware::error::{get_request_id_from_headers, ResponseObject};
use crate::payments::types::{validate_amount, CallbackChannel, CallbackParams};
use crate::services::payment_orchestrator::{CallbackOutcome, CreateOutcome};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    pub provider: String,
    pub order_id: String,
    /// Accepted as a JSON number or a decimal string.
    pub amount: JsonValue,
}

/// Callback result: the transaction plus the raw gateway code when declined.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackView {
    #[serde(flatten)]
    pub transaction: TransactionView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<String>,
}

/// Acknowledgement read by the gateway on the notification channel.
#[derive(Debug, Serialize, Deserialize)]
pub struct IpnAck {
    #[serde(rename = "RspCode")]
    pub rsp_code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

const MAX_AMOUNT_TEXT_LEN: usize = 32;

fn parse_amount(raw: &JsonValue) -> Result<BigDecimal, AppError> {
    let text = match raw {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.trim().to_string(),
        _ => return Err(AppError::validation("amount must be a number", Some("amount"))),
    };
    if text.len() > MAX_AMOUNT_TEXT_LEN {
        return Err(AppError::validation("amount is too long", Some("amount")));
    }
    BigDecimal::from_str(&text)
        .map_err(|_| AppError::validation("amount must be a decimal number", Some("amount")))
}

fn ack_message(code: &str) -> &'static str {
    match code {
        ack::CONFIRMED => "Confirm Success",
        ack::ORDER_NOT_FOUND => "Order not found",
        ack::ALREADY_PROCESSED => "Order already confirmed",
        ack::INVALID_AMOUNT => "Invalid amount",
        ack::INVALID_SIGNATURE => "Invalid signature",
        _ => "Unknown error",
    }
}

fn callback_response(outcome: &CallbackOutcome) -> Response {
    let status = StatusCode::from_u16(outcome.status_code()).unwrap_or(StatusCode::OK);
    let response_code = match outcome {
        CallbackOutcome::Declined { response_code, .. } => Some(response_code.clone()),
        _ => None,
    };
    ResponseObject::new(
        status,
        outcome.message(),
        Some(CallbackView {
            transaction: TransactionView::from(outcome.transaction()),
            response_code,
        }),
    )
    .into_response()
}

/// POST /api/payments
pub async fn create_payment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CreatePaymentRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let with_id = |e: AppError| match &request_id {
        Some(id) => e.with_request_id(id.clone()),
        None => e,
    };

    let Json(request) = payload.map_err(|e| with_id(AppError::validation(e.body_text(), None)))?;
    let amount = parse_amount(&request.amount).map_err(with_id)?;
    validate_amount(&amount).map_err(|e| with_id(e.into()))?;

    info!(
        order_id = %request.order_id,
        provider = %request.provider,
        amount = %amount,
        "Create payment requested"
    );

    let outcome = state
        .orchestrator
        .create_payment(&request.order_id, amount, &request.provider)
        .await
        .map_err(with_id)?;

    let status = match outcome {
        CreateOutcome::Created(_) => StatusCode::CREATED,
        CreateOutcome::AlreadyPending(_) => StatusCode::OK,
    };
    Ok(ResponseObject::new(
        status,
        outcome.message(),
        Some(TransactionView::from(outcome.transaction())),
    )
    .into_response())
}

/// GET /api/payments/{order_id}
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<ResponseObject<TransactionView>, AppError> {
    let tx = state.orchestrator.get_transaction(&order_id).await?;
    Ok(ResponseObject::ok("Transaction found", TransactionView::from(&tx)))
}

/// PUT /api/payments/cancel/{order_id}
pub async fn cancel_payment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<String>,
) -> Result<ResponseObject<TransactionView>, AppError> {
    let tx = state.orchestrator.cancel_pending(&order_id).await.map_err(|e| {
        match get_request_id_from_headers(&headers) {
            Some(id) => e.with_request_id(id),
            None => e,
        }
    })?;
    Ok(ResponseObject::ok("Payment cancelled", TransactionView::from(&tx)))
}

/// GET /api/payments/{provider}/return
///
/// User-facing redirect; the envelope drives the result page.
pub async fn payment_return(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, AppError> {
    let outcome = state
        .orchestrator
        .handle_callback(&provider, &params, CallbackChannel::Return)
        .await?;
    Ok(callback_response(&outcome))
}

/// GET /api/payments/{provider}/ipn
pub async fn payment_ipn(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> ResponseObject<IpnAck> {
    process_ipn(&state, &provider, params).await
}

/// POST /api/payments/{provider}/ipn
///
/// Parameters may arrive in the query string, a form body, or both.
pub async fn payment_ipn_post(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(mut params): Query<CallbackParams>,
    body: Bytes,
) -> ResponseObject<IpnAck> {
    for (key, value) in url::form_urlencoded::parse(&body) {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    process_ipn(&state, &provider, params).await
}

/// Always answers 200 so the gateway reads `RspCode` instead of retrying blindly.
async fn process_ipn(
    state: &AppState,
    provider: &str,
    params: HashMap<String, String>,
) -> ResponseObject<IpnAck> {
    let code = match state
        .orchestrator
        .handle_callback(provider, &params, CallbackChannel::Notification)
        .await
    {
        Ok(outcome) => outcome.ack_code(),
        Err(e) => {
            warn!(
                provider = %provider,
                error = %e,
                rsp_code = e.ack_code(),
                "Notification callback rejected"
            );
            e.ack_code()
        }
    };

    ResponseObject::ok(
        "Notification processed",
        IpnAck {
            rsp_code: code.to_string(),
            message: ack_message(code).to_string(),
        },
    )
}
