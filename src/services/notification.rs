use crate::database::transaction_repository::Transaction;
use crate::payments::types::ProviderName;
use crate::services::transaction_state::TransactionStatus;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationType {
    PaymentCompleted,
}

/// Published once per transaction, after its PAID status is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionEvent {
    pub notification_type: NotificationType,
    pub order_id: String,
    pub transaction_id: Option<String>,
    pub amount: BigDecimal,
    pub provider: ProviderName,
    pub status: TransactionStatus,
    pub occurred_at: DateTime<Utc>,
}

impl TransactionEvent {
    pub fn completed(tx: &Transaction) -> Self {
        Self {
            notification_type: NotificationType::PaymentCompleted,
            order_id: tx.order_id.clone(),
            transaction_id: tx.transaction_id.clone(),
            amount: tx.amount.clone(),
            provider: tx.provider,
            status: tx.status,
            occurred_at: Utc::now(),
        }
    }
}

/// Downstream consumer of completed payments (mail, billing, ...).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn notify(&self, event: &TransactionEvent);
}

#[derive(Debug, Default, Clone)]
pub struct NotificationService;

impl NotificationService {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventSink for NotificationService {
    async fn notify(&self, event: &TransactionEvent) {
        // Confirmation delivery hooks in here; for now the notice is logged.
        match event.notification_type {
            NotificationType::PaymentCompleted => {
                info!(
                    order_id = %event.order_id,
                    transaction_id = ?event.transaction_id,
                    amount = %event.amount,
                    provider = %event.provider,
                    "🔔 NOTIFICATION: Payment Completed"
                );
            }
        }
    }
}
