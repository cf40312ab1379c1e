use crate::database::error::DatabaseError;
use crate::payments::types::ProviderName;
use crate::services::transaction_state::TransactionStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{types::BigDecimal, FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

/// Payment transaction entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub order_id: String,
    pub amount: BigDecimal,
    pub status: TransactionStatus,
    pub provider: ProviderName,
    pub transaction_id: Option<String>,
    pub redirect_url: Option<String>,
    pub expiry_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new_pending(
        order_id: impl Into<String>,
        amount: BigDecimal,
        provider: ProviderName,
        redirect_url: Option<String>,
        created_at: DateTime<Utc>,
        expiry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: order_id.into(),
            amount,
            status: TransactionStatus::Pending,
            provider,
            transaction_id: None,
            redirect_url,
            expiry_time,
            created_at,
            updated_at: created_at,
        }
    }

    /// Still pending but past its deadline.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == TransactionStatus::Pending && now > self.expiry_time
    }
}

/// Row shape as stored; enums are persisted as text.
#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub id: Uuid,
    pub order_id: String,
    pub amount: BigDecimal,
    pub status: String,
    pub provider: String,
    pub transaction_id: Option<String>,
    pub redirect_url: Option<String>,
    pub expiry_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = DatabaseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            status: TransactionStatus::from_str(&row.status)
                .map_err(|e| DatabaseError::decode(e.to_string()))?,
            provider: ProviderName::from_str(&row.provider)
                .map_err(|e| DatabaseError::decode(e.to_string()))?,
            id: row.id,
            order_id: row.order_id,
            amount: row.amount,
            transaction_id: row.transaction_id,
            redirect_url: row.redirect_url,
            expiry_time: row.expiry_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Fields a conditional status update writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: TransactionStatus,
    /// Only applied when the stored reference is still empty.
    pub transaction_id: Option<String>,
}

impl StatusUpdate {
    pub fn status(status: TransactionStatus) -> Self {
        Self {
            status,
            transaction_id: None,
        }
    }
}

/// Durable keyed storage for payment transactions.
///
/// Every write that changes status is conditioned on the status the caller
/// last observed, which serializes concurrent callbacks, cancels and sweeps
/// on the same order.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Fails with a unique violation if `order_id` already exists.
    async fn insert(&self, tx: &Transaction) -> Result<Transaction, DatabaseError>;

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Transaction>, DatabaseError>;

    /// Compare-and-set. `None` when the stored status is no longer `expected`.
    async fn update_status_if(
        &self,
        order_id: &str,
        expected: TransactionStatus,
        update: StatusUpdate,
    ) -> Result<Option<Transaction>, DatabaseError>;

    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError>;

    /// Moves the given orders to EXPIRED if still pending and past expiry.
    /// Returns the order ids actually expired.
    async fn expire_pending(
        &self,
        order_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, DatabaseError>;

    async fn health_check(&self) -> Result<(), DatabaseError>;
}

const COLUMNS: &str = "id, order_id, amount, status, provider, transaction_id, redirect_url, \
                       expiry_time, created_at, updated_at";

/// Postgres-backed transaction store
pub struct PgTransactionRepository {
    pool: PgPool,
}

impl PgTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn convert(rows: Vec<TransactionRow>) -> Result<Vec<Transaction>, DatabaseError> {
        rows.into_iter().map(Transaction::try_from).collect()
    }
}

#[async_trait]
impl TransactionStore for PgTransactionRepository {
    async fn insert(&self, tx: &Transaction) -> Result<Transaction, DatabaseError> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "INSERT INTO payment_transactions
             (id, order_id, amount, status, provider, transaction_id, redirect_url,
              expiry_time, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {}",
            COLUMNS
        ))
        .bind(tx.id)
        .bind(&tx.order_id)
        .bind(&tx.amount)
        .bind(tx.status.as_str())
        .bind(tx.provider.as_str())
        .bind(&tx.transaction_id)
        .bind(&tx.redirect_url)
        .bind(tx.expiry_time)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Transaction::try_from(row)
    }

    async fn find_by_order_id(&self, order_id: &str) -> Result<Option<Transaction>, DatabaseError> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM payment_transactions WHERE order_id = $1",
            COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Transaction::try_from)
        .transpose()
    }

    async fn update_status_if(
        &self,
        order_id: &str,
        expected: TransactionStatus,
        update: StatusUpdate,
    ) -> Result<Option<Transaction>, DatabaseError> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "UPDATE payment_transactions
             SET status = $3,
                 transaction_id = COALESCE(transaction_id, $4),
                 updated_at = NOW()
             WHERE order_id = $1 AND status = $2
             RETURNING {}",
            COLUMNS
        ))
        .bind(order_id)
        .bind(expected.as_str())
        .bind(update.status.as_str())
        .bind(update.transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(Transaction::try_from)
        .transpose()
    }

    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM payment_transactions
             WHERE status = $1 AND expiry_time < $2
             ORDER BY expiry_time ASC
             LIMIT $3",
            COLUMNS
        ))
        .bind(TransactionStatus::Pending.as_str())
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Self::convert(rows)
    }

    async fn expire_pending(
        &self,
        order_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, DatabaseError> {
        if order_ids.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query_scalar::<_, String>(
            "UPDATE payment_transactions
             SET status = $1, updated_at = NOW()
             WHERE order_id = ANY($2) AND status = $3 AND expiry_time < $4
             RETURNING order_id",
        )
        .bind(TransactionStatus::Expired.as_str())
        .bind(order_ids)
        .bind(TransactionStatus::Pending.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn health_check(&self) -> Result<(), DatabaseError> {
        crate::database::health_check(&self.pool).await
    }
}
