use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::transaction_repository::{StatusUpdate, Transaction, TransactionStore};
use crate::services::transaction_state::TransactionStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-local store keyed by order id. Status updates are atomic under the
/// write lock, giving the same compare-and-set semantics as the SQL store.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<String, Transaction>>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.transactions.read().await.is_empty()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, tx: &Transaction) -> Result<Transaction, DatabaseError> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&tx.order_id) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: Some("payment_transactions_order_id_key".to_string()),
            }));
        }
        transactions.insert(tx.order_id.clone(), tx.clone());
        Ok(tx.clone())
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Transaction>, DatabaseError> {
        Ok(self.transactions.read().await.get(order_id).cloned())
    }

    async fn update_status_if(
        &self,
        order_id: &str,
        expected: TransactionStatus,
        update: StatusUpdate,
    ) -> Result<Option<Transaction>, DatabaseError> {
        let mut transactions = self.transactions.write().await;
        let Some(tx) = transactions.get_mut(order_id) else {
            return Ok(None);
        };
        if tx.status != expected {
            return Ok(None);
        }
        tx.status = update.status;
        if tx.transaction_id.is_none() {
            tx.transaction_id = update.transaction_id;
        }
        tx.updated_at = Utc::now();
        Ok(Some(tx.clone()))
    }

    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let transactions = self.transactions.read().await;
        let mut expired: Vec<Transaction> = transactions
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.expiry_time < now)
            .cloned()
            .collect();
        expired.sort_by_key(|tx| tx.expiry_time);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn expire_pending(
        &self,
        order_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, DatabaseError> {
        let mut transactions = self.transactions.write().await;
        let mut expired = Vec::new();
        for order_id in order_ids {
            if let Some(tx) = transactions.get_mut(order_id) {
                if tx.status == TransactionStatus::Pending && tx.expiry_time < now {
                    tx.status = TransactionStatus::Expired;
                    tx.updated_at = now;
                    expired.push(order_id.clone());
                }
            }
        }
        Ok(expired)
    }

    async fn health_check(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}
