//! Payment Orchestrator Service
//!
//! Creates pending transactions through the registered gateway, processes
//! gateway callbacks (return redirect and server-to-server notification) and
//! handles cancellation. Every status write is a compare-and-set against the
//! status read, so duplicate callbacks, concurrent channels and the expiry
//! sweeper can race on one order without double-applying a transition.

use crate::database::transaction_repository::{StatusUpdate, Transaction, TransactionStore};
use crate::error::{ack, AppError, AppErrorKind};
use crate::payments::factory::{ProviderEntry, ProviderRegistry};
use crate::payments::types::{
    validate_amount, CallbackChannel, CallbackParams, PaymentRequest, PaymentState, ProviderName,
};
use crate::services::notification::{EventSink, TransactionEvent};
use crate::services::transaction_state::{TransactionStateMachine, TransactionStatus};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

/// Compare-and-set attempts before giving up on a contended cancel.
const MAX_CANCEL_ATTEMPTS: usize = 3;

/// Gateway-safe order reference: 1-64 chars of `[A-Za-z0-9_-]`.
fn is_valid_order_id(order_id: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-]{1,64}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(order_id))
}

// ============================================================================
// Outcome Types
// ============================================================================

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Transaction),
    /// Idempotent retry of a still-payable order.
    AlreadyPending(Transaction),
}

impl CreateOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            CreateOutcome::Created(tx) | CreateOutcome::AlreadyPending(tx) => tx,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CreateOutcome::Created(_) => "Payment created",
            CreateOutcome::AlreadyPending(_) => "Payment already pending",
        }
    }
}

#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    /// This callback moved the transaction to PAID.
    Confirmed(Transaction),
    /// Nothing changed; carries the current state.
    AlreadyProcessed(Transaction),
    /// Gateway declined; the transaction is now FAILED.
    Declined {
        transaction: Transaction,
        response_code: String,
    },
}

impl CallbackOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            CallbackOutcome::Confirmed(tx) | CallbackOutcome::AlreadyProcessed(tx) => tx,
            CallbackOutcome::Declined { transaction, .. } => transaction,
        }
    }

    pub fn ack_code(&self) -> &'static str {
        match self {
            CallbackOutcome::Confirmed(_) | CallbackOutcome::Declined { .. } => ack::CONFIRMED,
            CallbackOutcome::AlreadyProcessed(_) => ack::ALREADY_PROCESSED,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            CallbackOutcome::Confirmed(_) | CallbackOutcome::AlreadyProcessed(_) => 200,
            CallbackOutcome::Declined { .. } => 402,
        }
    }

    pub fn message(&self) -> String {
        match self {
            CallbackOutcome::Confirmed(_) => "Payment successful".to_string(),
            CallbackOutcome::AlreadyProcessed(tx) => {
                format!("Transaction already processed with status {}", tx.status)
            }
            CallbackOutcome::Declined { response_code, .. } => {
                format!("Payment failed with response code {}", response_code)
            }
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct PaymentOrchestrator {
    registry: ProviderRegistry,
    store: Arc<dyn TransactionStore>,
    events: Arc<dyn EventSink>,
}

impl PaymentOrchestrator {
    pub fn new(
        registry: ProviderRegistry,
        store: Arc<dyn TransactionStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            store,
            events,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn TransactionStore> {
        self.store.clone()
    }

    fn resolve_provider(&self, raw: &str) -> Result<(ProviderName, &ProviderEntry), AppError> {
        let unsupported = || {
            AppError::new(AppErrorKind::UnsupportedProvider {
                provider: raw.to_string(),
            })
        };
        let name = ProviderName::from_str(raw).map_err(|_| unsupported())?;
        let entry = self.registry.get(name).ok_or_else(unsupported)?;
        Ok((name, entry))
    }

    pub async fn get_transaction(&self, order_id: &str) -> Result<Transaction, AppError> {
        self.store
            .find_by_order_id(order_id)
            .await?
            .ok_or_else(|| AppError::not_found(order_id))
    }

    // ------------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------------

    pub async fn create_payment(
        &self,
        order_id: &str,
        amount: BigDecimal,
        provider: &str,
    ) -> Result<CreateOutcome, AppError> {
        let order_id = order_id.trim();
        if !is_valid_order_id(order_id) {
            return Err(AppError::validation(
                "orderId must be 1-64 characters of letters, digits, '-' or '_'",
                Some("orderId"),
            ));
        }
        validate_amount(&amount).map_err(AppError::from)?;
        let (provider_name, entry) = self.resolve_provider(provider)?;

        let now = Utc::now();
        if let Some(existing) = self.store.find_by_order_id(order_id).await? {
            return self
                .resolve_existing(existing, &amount, provider_name, now)
                .await;
        }

        let expiry_time = now + entry.provider.payment_window();
        let request = PaymentRequest {
            order_id: order_id.to_string(),
            amount: amount.clone(),
            order_info: format!("Payment for order {}", order_id),
            created_at: now,
            expiry_time,
        };

        let response = entry
            .guard
            .call("initiate_payment", || {
                let provider = entry.provider.clone();
                let request = request.clone();
                async move { provider.initiate_payment(request).await }
            })
            .await
            .map_err(|e| {
                warn!(
                    order_id = %order_id,
                    provider = %provider_name,
                    error = %e,
                    "Gateway call failed during payment creation"
                );
                AppError::from(e)
            })?;

        if response.status == PaymentState::Failed {
            return Err(AppError::new(AppErrorKind::GatewayUnavailable {
                provider: provider_name.to_string(),
                message: "gateway rejected the payment request".to_string(),
            }));
        }

        let pending = Transaction::new_pending(
            order_id,
            amount.clone(),
            provider_name,
            response.redirect_url.clone(),
            now,
            expiry_time,
        );

        let created = match self.store.insert(&pending).await {
            Ok(created) => created,
            Err(e) if e.is_unique_violation() => {
                // Lost a creation race; answer as if the winner already existed.
                let existing = self.get_transaction(order_id).await?;
                return self
                    .resolve_existing(existing, &amount, provider_name, now)
                    .await;
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            order_id = %created.order_id,
            provider = %provider_name,
            amount = %created.amount,
            expiry_time = %created.expiry_time,
            to_status = %created.status,
            "Payment transaction created"
        );

        if response.status == PaymentState::Success {
            if let Some(reference) = response.provider_reference.as_deref() {
                return match self.confirm_paid(created, reference).await? {
                    CallbackOutcome::Confirmed(tx) | CallbackOutcome::AlreadyProcessed(tx) => {
                        Ok(CreateOutcome::Created(tx))
                    }
                    CallbackOutcome::Declined { transaction, .. } => {
                        Ok(CreateOutcome::Created(transaction))
                    }
                };
            }
        }

        Ok(CreateOutcome::Created(created))
    }

    async fn resolve_existing(
        &self,
        existing: Transaction,
        amount: &BigDecimal,
        provider: ProviderName,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome, AppError> {
        let duplicate = |tx: &Transaction| {
            AppError::new(AppErrorKind::DuplicateOrder {
                order_id: tx.order_id.clone(),
                status: tx.status,
            })
        };

        if existing.status != TransactionStatus::Pending {
            return Err(duplicate(&existing));
        }
        if existing.is_expired_at(now) {
            let current = self.expire(&existing).await?;
            return Err(duplicate(&current));
        }
        if existing.amount == *amount && existing.provider == provider {
            info!(order_id = %existing.order_id, "Returning existing pending payment");
            return Ok(CreateOutcome::AlreadyPending(existing));
        }
        Err(duplicate(&existing))
    }

    /// PENDING -> EXPIRED. Returns whatever status the row ends up in.
    async fn expire(&self, tx: &Transaction) -> Result<Transaction, AppError> {
        let mut next = tx.clone();
        TransactionStateMachine::transition(&mut next, TransactionStatus::Expired)
            .map_err(|e| e.into_app_error(&tx.order_id))?;

        match self
            .store
            .update_status_if(
                &tx.order_id,
                TransactionStatus::Pending,
                StatusUpdate::status(TransactionStatus::Expired),
            )
            .await?
        {
            Some(saved) => {
                info!(
                    order_id = %saved.order_id,
                    from_status = %TransactionStatus::Pending,
                    to_status = %saved.status,
                    "Pending transaction expired"
                );
                Ok(saved)
            }
            None => self.get_transaction(&tx.order_id).await,
        }
    }

    // ------------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------------

    pub async fn handle_callback(
        &self,
        provider: &str,
        params: &CallbackParams,
        channel: CallbackChannel,
    ) -> Result<CallbackOutcome, AppError> {
        let (provider_name, entry) = self.resolve_provider(provider)?;
        let payload = entry.provider.parse_callback(params).map_err(|e| {
            warn!(channel = channel.as_str(), error = %e, "Rejected malformed callback");
            AppError::from(e)
        })?;
        let order_id = payload.order_id.as_str();

        let tx = self.get_transaction(order_id).await.map_err(|e| {
            warn!(order_id = %order_id, channel = channel.as_str(), "Callback for unknown order");
            e
        })?;

        if tx.provider != provider_name {
            return Err(AppError::validation(
                format!("order {} was not created with {}", order_id, provider_name),
                Some("provider"),
            ));
        }

        if tx.status.is_settled() {
            info!(
                order_id = %order_id,
                channel = channel.as_str(),
                status = %tx.status,
                "Callback for already processed transaction"
            );
            return Ok(CallbackOutcome::AlreadyProcessed(tx));
        }

        if tx.is_expired_at(Utc::now()) {
            let current = self.expire(&tx).await?;
            if current.status != TransactionStatus::Expired {
                return Ok(CallbackOutcome::AlreadyProcessed(current));
            }
            warn!(order_id = %order_id, channel = channel.as_str(), "Callback arrived after expiry");
            return Err(AppError::new(AppErrorKind::Expired {
                order_id: order_id.to_string(),
            }));
        }

        let verification = entry.provider.verify_callback(params);
        if !verification.valid {
            warn!(
                order_id = %order_id,
                channel = channel.as_str(),
                reason = ?verification.reason,
                diagnostics = ?verification.diagnostics,
                "Callback signature mismatch"
            );
            return Err(AppError::new(AppErrorKind::SignatureMismatch {
                order_id: order_id.to_string(),
                diagnostics: verification.diagnostics,
            }));
        }

        if let Some(received) = payload.amount_minor {
            let expected = entry
                .provider
                .amount_in_minor_units(&tx.amount)
                .map_err(AppError::from)?;
            if received != expected {
                warn!(
                    order_id = %order_id,
                    channel = channel.as_str(),
                    expected = expected,
                    received = received,
                    "Callback amount mismatch"
                );
                return Err(AppError::new(AppErrorKind::AmountMismatch {
                    order_id: order_id.to_string(),
                    expected,
                    received,
                }));
            }
        }

        if payload.response_code == entry.provider.success_code() {
            let reference = payload.provider_reference.as_deref().ok_or_else(|| {
                AppError::validation(
                    "approved callback is missing the gateway transaction number",
                    Some("vnp_TransactionNo"),
                )
            })?;
            return self.confirm_paid(tx, reference).await;
        }

        self.decline(tx, &payload.response_code, channel).await
    }

    /// PENDING -> PAID plus the completion event, exactly once per order.
    async fn confirm_paid(
        &self,
        tx: Transaction,
        reference: &str,
    ) -> Result<CallbackOutcome, AppError> {
        let mut next = tx.clone();
        TransactionStateMachine::mark_paid(&mut next, reference)
            .map_err(|e| e.into_app_error(&tx.order_id))?;

        let update = StatusUpdate {
            status: TransactionStatus::Paid,
            transaction_id: Some(reference.to_string()),
        };
        match self
            .store
            .update_status_if(&tx.order_id, TransactionStatus::Pending, update)
            .await?
        {
            Some(saved) => {
                self.events.notify(&TransactionEvent::completed(&saved)).await;
                Ok(CallbackOutcome::Confirmed(saved))
            }
            None => {
                let current = self.get_transaction(&tx.order_id).await?;
                info!(
                    order_id = %tx.order_id,
                    status = %current.status,
                    "Concurrent update won; payment confirmation skipped"
                );
                Ok(CallbackOutcome::AlreadyProcessed(current))
            }
        }
    }

    async fn decline(
        &self,
        tx: Transaction,
        response_code: &str,
        channel: CallbackChannel,
    ) -> Result<CallbackOutcome, AppError> {
        let mut next = tx.clone();
        let from = TransactionStateMachine::transition(&mut next, TransactionStatus::Failed)
            .map_err(|e| e.into_app_error(&tx.order_id))?;

        match self
            .store
            .update_status_if(
                &tx.order_id,
                from,
                StatusUpdate::status(TransactionStatus::Failed),
            )
            .await?
        {
            Some(saved) => {
                warn!(
                    order_id = %saved.order_id,
                    channel = channel.as_str(),
                    response_code = %response_code,
                    "Gateway declined payment"
                );
                Ok(CallbackOutcome::Declined {
                    transaction: saved,
                    response_code: response_code.to_string(),
                })
            }
            None => Ok(CallbackOutcome::AlreadyProcessed(
                self.get_transaction(&tx.order_id).await?,
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------------

    pub async fn cancel_pending(&self, order_id: &str) -> Result<Transaction, AppError> {
        for _ in 0..MAX_CANCEL_ATTEMPTS {
            let tx = self.get_transaction(order_id).await?;
            let mut next = tx.clone();
            let from = TransactionStateMachine::cancel(&mut next)
                .map_err(|e| e.into_app_error(order_id))?;

            if let Some(saved) = self
                .store
                .update_status_if(
                    order_id,
                    from,
                    StatusUpdate::status(TransactionStatus::Cancelled),
                )
                .await?
            {
                return Ok(saved);
            }
        }

        error!(order_id = %order_id, "Cancel kept losing to concurrent updates");
        Err(AppError::internal(format!(
            "could not cancel {} due to concurrent updates",
            order_id
        )))
    }
}
