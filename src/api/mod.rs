pub mod payments;

use crate::database::transaction_repository::Transaction;
use crate::health::health;
use crate::payments::types::ProviderName;
use crate::services::payment_orchestrator::PaymentOrchestrator;
use crate::services::transaction_state::TransactionStatus;
use axum::{
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
}

/// Client-facing projection of a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub order_id: String,
    pub amount: String,
    pub status: TransactionStatus,
    pub provider: ProviderName,
    pub transaction_id: Option<String>,
    pub redirect_url: Option<String>,
}

impl From<&Transaction> for TransactionView {
    fn from(tx: &Transaction) -> Self {
        Self {
            order_id: tx.order_id.clone(),
            amount: tx.amount.with_scale(2).to_string(),
            status: tx.status,
            provider: tx.provider,
            transaction_id: tx.transaction_id.clone(),
            redirect_url: tx.redirect_url.clone(),
        }
    }
}

pub fn router(orchestrator: Arc<PaymentOrchestrator>) -> Router {
    let state = Arc::new(AppState { orchestrator });

    // `{id}` is the order id on lookup and the provider tag on callbacks;
    // sibling parameters must share a name.
    Router::new()
        .route("/health", get(health))
        .route("/api/payments", post(payments::create_payment))
        .route("/api/payments/{id}", get(payments::get_payment))
        .route("/api/payments/cancel/{order_id}", put(payments::cancel_payment))
        .route("/api/payments/{id}/return", get(payments::payment_return))
        .route(
            "/api/payments/{id}/ipn",
            get(payments::payment_ipn).post(payments::payment_ipn_post),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
