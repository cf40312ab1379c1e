//! Transaction lifecycle
//!
//! The legal state graph and the three mutating operations built on it:
//! a generic [`TransactionStateMachine::transition`], the stricter
//! [`TransactionStateMachine::mark_paid`] business rule, and
//! [`TransactionStateMachine::cancel`].

use crate::database::transaction_repository::Transaction;
use crate::error::{AppError, AppErrorKind};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Initiated,
    Pending,
    Processing,
    Authorized,
    Captured,
    Paid,
    PartiallyRefunded,
    FullyRefunded,
    Failed,
    Expired,
    Cancelled,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 11] = [
        TransactionStatus::Initiated,
        TransactionStatus::Pending,
        TransactionStatus::Processing,
        TransactionStatus::Authorized,
        TransactionStatus::Captured,
        TransactionStatus::Paid,
        TransactionStatus::PartiallyRefunded,
        TransactionStatus::FullyRefunded,
        TransactionStatus::Failed,
        TransactionStatus::Expired,
        TransactionStatus::Cancelled,
    ];

    /// Get all valid transitions from this state
    pub fn valid_transitions(&self) -> &'static [TransactionStatus] {
        use TransactionStatus::*;
        match self {
            Initiated => &[Pending, Cancelled],
            Pending => &[Processing, Failed, Expired, Cancelled],
            Processing => &[Authorized, Failed, Cancelled],
            Authorized => &[Captured, Failed, Cancelled],
            Captured => &[Paid, PartiallyRefunded, FullyRefunded],
            Paid => &[PartiallyRefunded, FullyRefunded],
            PartiallyRefunded => &[FullyRefunded],
            // Terminal states - no valid transitions
            FullyRefunded | Failed | Expired | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, target: TransactionStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Failed
                | TransactionStatus::Expired
                | TransactionStatus::Cancelled
                | TransactionStatus::FullyRefunded
        )
    }

    /// States a callback treats as settled: re-delivery must not mutate them.
    pub fn is_settled(&self) -> bool {
        *self != TransactionStatus::Pending && *self != TransactionStatus::Initiated
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Pending | TransactionStatus::Failed | TransactionStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Initiated => "INITIATED",
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::Authorized => "AUTHORIZED",
            TransactionStatus::Captured => "CAPTURED",
            TransactionStatus::Paid => "PAID",
            TransactionStatus::PartiallyRefunded => "PARTIALLY_REFUNDED",
            TransactionStatus::FullyRefunded => "FULLY_REFUNDED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Expired => "EXPIRED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = StateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TransactionStatus::ALL
            .iter()
            .copied()
            .find(|s| s.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| StateError::UnknownStatus(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("only a PENDING transaction can be marked paid (current: {current})")]
    NotPending { current: TransactionStatus },

    #[error("unknown transaction status: {0}")]
    UnknownStatus(String),
}

impl StateError {
    pub fn into_app_error(self, order_id: &str) -> AppError {
        match self {
            StateError::IllegalTransition { from, to } => {
                AppError::new(AppErrorKind::IllegalStateTransition {
                    order_id: order_id.to_string(),
                    from,
                    to,
                })
            }
            StateError::NotPending { current } => AppError::new(AppErrorKind::BusinessRule {
                order_id: order_id.to_string(),
                status: current,
                message: format!(
                    "Transaction for order '{}' is {}, only PENDING can be marked paid",
                    order_id, current
                ),
            }),
            StateError::UnknownStatus(raw) => {
                AppError::internal(format!("unknown stored status '{}' for {}", raw, order_id))
            }
        }
    }
}

/// Enforces the state graph on in-memory transactions. Callers persist the
/// result with a store update conditioned on the previous status.
pub struct TransactionStateMachine;

impl TransactionStateMachine {
    /// Returns the status the transaction held before the transition.
    pub fn transition(
        tx: &mut Transaction,
        target: TransactionStatus,
    ) -> Result<TransactionStatus, StateError> {
        let from = tx.status;
        if !from.can_transition_to(target) {
            return Err(StateError::IllegalTransition { from, to: target });
        }
        tx.status = target;
        info!(
            order_id = %tx.order_id,
            from_status = %from,
            to_status = %target,
            "Transaction state transition"
        );
        Ok(from)
    }

    /// PENDING -> PAID, recording the gateway reference. Stricter than the graph.
    pub fn mark_paid(tx: &mut Transaction, gateway_txn_id: &str) -> Result<(), StateError> {
        if tx.status != TransactionStatus::Pending {
            return Err(StateError::NotPending { current: tx.status });
        }
        tx.status = TransactionStatus::Paid;
        if tx.transaction_id.is_none() {
            tx.transaction_id = Some(gateway_txn_id.to_string());
        }
        info!(
            order_id = %tx.order_id,
            from_status = %TransactionStatus::Pending,
            to_status = %TransactionStatus::Paid,
            transaction_id = %gateway_txn_id,
            "Transaction marked paid"
        );
        Ok(())
    }

    pub fn cancel(tx: &mut Transaction) -> Result<TransactionStatus, StateError> {
        let from = tx.status;
        if !from.is_cancellable() {
            return Err(StateError::IllegalTransition {
                from,
                to: TransactionStatus::Cancelled,
            });
        }
        tx.status = TransactionStatus::Cancelled;
        info!(
            order_id = %tx.order_id,
            from_status = %from,
            to_status = %TransactionStatus::Cancelled,
            "Transaction cancelled"
        );
        Ok(from)
    }
}
