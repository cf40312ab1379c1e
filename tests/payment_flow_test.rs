//! Integration tests for the payment lifecycle
//!
//! Tests cover:
//! - Create, confirm and replay of an approved payment
//! - Declined and tampered callbacks
//! - Expiry through callbacks and the sweeper
//! - Duplicate order policy
//! - Cancellation rules
//! - Concurrent callback delivery
//! - Gateway outages during creation

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use payment_gateway::database::{InMemoryTransactionStore, Transaction, TransactionStore};
use payment_gateway::error::AppErrorKind;
use payment_gateway::logging::MaskedSecret;
use payment_gateway::payments::providers::{VnPayConfig, VnPayProvider};
use payment_gateway::payments::signature::SignatureCodec;
use payment_gateway::payments::utils::GatewayConfig;
use payment_gateway::payments::types::{
    CallbackPayload, PaymentRequest, PaymentResponse, WebhookVerificationResult,
};
use payment_gateway::payments::{
    CallbackChannel, CallbackParams, PaymentError, PaymentProvider, PaymentResult, ProviderName,
    ProviderRegistry,
};
use payment_gateway::services::notification::{EventSink, TransactionEvent};
use payment_gateway::services::{
    CallbackOutcome, CreateOutcome, PaymentOrchestrator, TransactionStatus,
};
use payment_gateway::workers::{ExpirySweeper, SweeperConfig};

const SECRET: &str = "TESTSECRETKEY1234567890ABCDEFGHI";
const TMN_CODE: &str = "TESTTMN1";

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<TransactionEvent>>,
}

impl RecordingSink {
    fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn notify(&self, event: &TransactionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Gateway client whose every initiation fails at the network layer.
#[derive(Default)]
struct UnreachableGateway {
    calls: AtomicUsize,
}

#[async_trait]
impl PaymentProvider for UnreachableGateway {
    async fn initiate_payment(&self, _request: PaymentRequest) -> PaymentResult<PaymentResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PaymentError::NetworkError {
            message: "connection refused".to_string(),
        })
    }

    fn name(&self) -> ProviderName {
        ProviderName::Vnpay
    }

    fn payment_window(&self) -> ChronoDuration {
        ChronoDuration::minutes(15)
    }

    fn success_code(&self) -> &'static str {
        "00"
    }

    fn verify_callback(&self, _params: &CallbackParams) -> WebhookVerificationResult {
        WebhookVerificationResult {
            valid: false,
            reason: Some("gateway unreachable".to_string()),
            diagnostics: None,
        }
    }

    fn parse_callback(&self, _params: &CallbackParams) -> PaymentResult<CallbackPayload> {
        Err(PaymentError::validation("missing required parameter vnp_TxnRef", "vnp_TxnRef"))
    }
}

struct Harness {
    orchestrator: Arc<PaymentOrchestrator>,
    store: Arc<InMemoryTransactionStore>,
    sink: Arc<RecordingSink>,
}

fn harness() -> Harness {
    let config = VnPayConfig {
        tmn_code: TMN_CODE.to_string(),
        hash_secret: MaskedSecret::new(SECRET),
        ..VnPayConfig::default()
    };
    let mut registry = ProviderRegistry::new();
    registry.register(
        Arc::new(VnPayProvider::new(config).unwrap()),
        GatewayConfig::default(),
    );

    let store = Arc::new(InMemoryTransactionStore::new());
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = Arc::new(PaymentOrchestrator::new(
        registry,
        store.clone(),
        sink.clone(),
    ));
    Harness {
        orchestrator,
        store,
        sink,
    }
}

/// Gateway callback parameters signed with the shared secret.
fn signed_callback(
    order_id: &str,
    amount_minor: i64,
    response_code: &str,
    transaction_no: &str,
) -> HashMap<String, String> {
    let mut params: HashMap<String, String> = [
        ("vnp_Amount", amount_minor.to_string()),
        ("vnp_BankCode", "NCB".to_string()),
        ("vnp_OrderInfo", format!("Payment for order {}", order_id)),
        ("vnp_PayDate", "20260101103000".to_string()),
        ("vnp_ResponseCode", response_code.to_string()),
        ("vnp_TmnCode", TMN_CODE.to_string()),
        ("vnp_TransactionNo", transaction_no.to_string()),
        ("vnp_TransactionStatus", response_code.to_string()),
        ("vnp_TxnRef", order_id.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let hash = SignatureCodec::new(MaskedSecret::new(SECRET))
        .sign(&params)
        .unwrap();
    params.insert("vnp_SecureHash".to_string(), hash);
    params
}

async fn insert_pending(store: &InMemoryTransactionStore, order_id: &str, expires_in_minutes: i64) {
    let now = Utc::now();
    let tx = Transaction::new_pending(
        order_id,
        BigDecimal::from(100000),
        ProviderName::Vnpay,
        Some("https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".to_string()),
        now - ChronoDuration::minutes(20),
        now + ChronoDuration::minutes(expires_in_minutes),
    );
    store.insert(&tx).await.unwrap();
}

async fn status_of(store: &InMemoryTransactionStore, order_id: &str) -> TransactionStatus {
    store
        .find_by_order_id(order_id)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn approved_payment_is_confirmed_exactly_once() {
    let h = harness();

    let created = h
        .orchestrator
        .create_payment("ORD1", BigDecimal::from(100000), "VNPAY")
        .await
        .unwrap();
    let CreateOutcome::Created(tx) = created else {
        panic!("expected a new transaction");
    };
    assert_eq!(tx.status, TransactionStatus::Pending);
    let redirect = tx.redirect_url.clone().unwrap();
    assert!(redirect.contains("vnp_TxnRef=ORD1"));
    assert!(redirect.contains("vnp_Amount=10000000"));
    assert!(redirect.contains("vnp_SecureHash="));
    let window = tx.expiry_time - tx.created_at;
    assert_eq!(window, ChronoDuration::minutes(15));

    let params = signed_callback("ORD1", 10_000_000, "00", "14000001");
    let outcome = h
        .orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Notification)
        .await
        .unwrap();
    assert!(matches!(outcome, CallbackOutcome::Confirmed(_)));
    assert_eq!(outcome.transaction().status, TransactionStatus::Paid);
    assert_eq!(
        outcome.transaction().transaction_id.as_deref(),
        Some("14000001")
    );

    // Same event through the return redirect, then a replay with another reference.
    let replay = h
        .orchestrator
        .handle_callback("vnpay", &params, CallbackChannel::Return)
        .await
        .unwrap();
    assert!(matches!(replay, CallbackOutcome::AlreadyProcessed(_)));
    assert_eq!(replay.ack_code(), "02");

    let other = signed_callback("ORD1", 10_000_000, "00", "14000002");
    let replay = h
        .orchestrator
        .handle_callback("VNPAY", &other, CallbackChannel::Notification)
        .await
        .unwrap();
    assert!(matches!(replay, CallbackOutcome::AlreadyProcessed(_)));

    let stored = h.store.find_by_order_id("ORD1").await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Paid);
    assert_eq!(stored.transaction_id.as_deref(), Some("14000001"));

    assert_eq!(h.sink.count(), 1);
    let events = h.sink.events.lock().unwrap();
    assert_eq!(events[0].order_id, "ORD1");
    assert_eq!(events[0].transaction_id.as_deref(), Some("14000001"));
}

#[tokio::test]
async fn declined_callback_marks_transaction_failed() {
    let h = harness();
    h.orchestrator
        .create_payment("ORD2", BigDecimal::from(100000), "VNPAY")
        .await
        .unwrap();

    let params = signed_callback("ORD2", 10_000_000, "24", "0");
    let outcome = h
        .orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Return)
        .await
        .unwrap();

    match &outcome {
        CallbackOutcome::Declined {
            transaction,
            response_code,
        } => {
            assert_eq!(response_code, "24");
            assert_eq!(transaction.status, TransactionStatus::Failed);
            assert_eq!(transaction.transaction_id, None);
        }
        other => panic!("expected a declined outcome, got {:?}", other),
    }
    assert_eq!(status_of(&h.store, "ORD2").await, TransactionStatus::Failed);
    assert_eq!(h.sink.count(), 0);
}

#[tokio::test]
async fn tampered_signature_leaves_transaction_untouched() {
    let h = harness();
    h.orchestrator
        .create_payment("ORD3", BigDecimal::from(100000), "VNPAY")
        .await
        .unwrap();

    let mut params = signed_callback("ORD3", 10_000_000, "00", "14000003");
    let hash = params.get_mut("vnp_SecureHash").unwrap();
    let flipped = if hash.starts_with('0') { "1" } else { "0" };
    hash.replace_range(0..1, flipped);

    let err = h
        .orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Notification)
        .await
        .unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::SignatureMismatch { .. }));
    assert_eq!(err.ack_code(), "97");

    let diagnostics = err.diagnostics().unwrap();
    assert!(diagnostics.get("secret").is_none());
    assert!(!diagnostics.to_string().contains(SECRET));
    assert!(!diagnostics.to_string().contains("TE****HI"));

    assert_eq!(status_of(&h.store, "ORD3").await, TransactionStatus::Pending);
    assert_eq!(h.sink.count(), 0);
}

#[tokio::test]
async fn tampered_amount_is_rejected_by_signature() {
    let h = harness();
    h.orchestrator
        .create_payment("ORD4", BigDecimal::from(100000), "VNPAY")
        .await
        .unwrap();

    let mut params = signed_callback("ORD4", 10_000_000, "00", "14000004");
    params.insert("vnp_Amount".to_string(), "100".to_string());

    let err = h
        .orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Notification)
        .await
        .unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::SignatureMismatch { .. }));
    assert_eq!(status_of(&h.store, "ORD4").await, TransactionStatus::Pending);
}

#[tokio::test]
async fn signed_amount_mismatch_is_rejected() {
    let h = harness();
    h.orchestrator
        .create_payment("ORD5", BigDecimal::from(100000), "VNPAY")
        .await
        .unwrap();

    let params = signed_callback("ORD5", 100, "00", "14000005");
    let err = h
        .orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Notification)
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind,
        AppErrorKind::AmountMismatch {
            expected: 10_000_000,
            received: 100,
            ..
        }
    ));
    assert_eq!(err.ack_code(), "04");
    assert_eq!(status_of(&h.store, "ORD5").await, TransactionStatus::Pending);
}

#[tokio::test]
async fn approved_callback_without_reference_is_rejected() {
    let h = harness();
    h.orchestrator
        .create_payment("ORD6", BigDecimal::from(100000), "VNPAY")
        .await
        .unwrap();

    let params = signed_callback("ORD6", 10_000_000, "00", "0");
    let err = h
        .orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Notification)
        .await
        .unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::Validation { .. }));
    assert_eq!(status_of(&h.store, "ORD6").await, TransactionStatus::Pending);
}

#[tokio::test]
async fn callback_for_unknown_order_is_not_found() {
    let h = harness();
    let params = signed_callback("MISSING", 10_000_000, "00", "1");
    let err = h
        .orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Notification)
        .await
        .unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::NotFound { .. }));
    assert_eq!(err.ack_code(), "01");
}

#[tokio::test]
async fn late_approval_after_expiry_never_pays() {
    let h = harness();
    insert_pending(&h.store, "LATE1", -1).await;

    let params = signed_callback("LATE1", 10_000_000, "00", "14000010");
    let err = h
        .orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Notification)
        .await
        .unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::Expired { .. }));
    assert_eq!(status_of(&h.store, "LATE1").await, TransactionStatus::Expired);

    let again = h
        .orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Return)
        .await
        .unwrap();
    assert!(matches!(again, CallbackOutcome::AlreadyProcessed(_)));
    assert_eq!(again.transaction().status, TransactionStatus::Expired);
    assert_eq!(again.transaction().transaction_id, None);
    assert_eq!(h.sink.count(), 0);
}

#[tokio::test]
async fn sweeper_expiry_blocks_delayed_approval() {
    let h = harness();
    insert_pending(&h.store, "LATE2", -1).await;
    insert_pending(&h.store, "OPEN1", 10).await;

    let sweeper = ExpirySweeper::new(h.store.clone(), SweeperConfig::default());
    let report = sweeper.sweep_once(Utc::now()).await.unwrap();
    assert_eq!(report.expired, vec!["LATE2".to_string()]);

    let params = signed_callback("LATE2", 10_000_000, "00", "14000011");
    let outcome = h
        .orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Notification)
        .await
        .unwrap();
    assert!(matches!(outcome, CallbackOutcome::AlreadyProcessed(_)));
    assert_eq!(status_of(&h.store, "LATE2").await, TransactionStatus::Expired);
    assert_eq!(status_of(&h.store, "OPEN1").await, TransactionStatus::Pending);
    assert_eq!(h.sink.count(), 0);
}

#[tokio::test]
async fn duplicate_create_policy() {
    let h = harness();
    let amount = BigDecimal::from(100000);

    let first = h
        .orchestrator
        .create_payment("DUP1", amount.clone(), "VNPAY")
        .await
        .unwrap();
    let retry = h
        .orchestrator
        .create_payment("DUP1", amount.clone(), "vnpay")
        .await
        .unwrap();
    assert!(matches!(retry, CreateOutcome::AlreadyPending(_)));
    assert_eq!(retry.message(), "Payment already pending");
    assert_eq!(retry.transaction().id, first.transaction().id);
    assert_eq!(retry.transaction().redirect_url, first.transaction().redirect_url);

    let err = h
        .orchestrator
        .create_payment("DUP1", BigDecimal::from(200000), "VNPAY")
        .await
        .unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::DuplicateOrder { .. }));

    let params = signed_callback("DUP1", 10_000_000, "00", "14000020");
    h.orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Notification)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .create_payment("DUP1", amount.clone(), "VNPAY")
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind,
        AppErrorKind::DuplicateOrder {
            status: TransactionStatus::Paid,
            ..
        }
    ));

    insert_pending(&h.store, "DUP2", -1).await;
    let err = h
        .orchestrator
        .create_payment("DUP2", amount, "VNPAY")
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind,
        AppErrorKind::DuplicateOrder {
            status: TransactionStatus::Expired,
            ..
        }
    ));
    assert_eq!(status_of(&h.store, "DUP2").await, TransactionStatus::Expired);
}

#[tokio::test]
async fn create_rejects_sub_cent_amounts_and_unknown_providers() {
    let h = harness();

    let err = h
        .orchestrator
        .create_payment("ORD7", BigDecimal::from_str("10.001").unwrap(), "VNPAY")
        .await
        .unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::Validation { .. }));

    let err = h
        .orchestrator
        .create_payment("ORD7", BigDecimal::from(1000), "MOMO")
        .await
        .unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::UnsupportedProvider { .. }));
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn cancellation_rules() {
    let h = harness();

    h.orchestrator
        .create_payment("CAN1", BigDecimal::from(100000), "VNPAY")
        .await
        .unwrap();
    let cancelled = h.orchestrator.cancel_pending("CAN1").await.unwrap();
    assert_eq!(cancelled.status, TransactionStatus::Cancelled);

    let err = h.orchestrator.cancel_pending("CAN1").await.unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::IllegalStateTransition { .. }));

    h.orchestrator
        .create_payment("CAN2", BigDecimal::from(100000), "VNPAY")
        .await
        .unwrap();
    let declined = signed_callback("CAN2", 10_000_000, "24", "0");
    h.orchestrator
        .handle_callback("VNPAY", &declined, CallbackChannel::Return)
        .await
        .unwrap();
    let cancelled = h.orchestrator.cancel_pending("CAN2").await.unwrap();
    assert_eq!(cancelled.status, TransactionStatus::Cancelled);

    h.orchestrator
        .create_payment("CAN3", BigDecimal::from(100000), "VNPAY")
        .await
        .unwrap();
    let approved = signed_callback("CAN3", 10_000_000, "00", "14000030");
    h.orchestrator
        .handle_callback("VNPAY", &approved, CallbackChannel::Return)
        .await
        .unwrap();
    let err = h.orchestrator.cancel_pending("CAN3").await.unwrap_err();
    assert!(matches!(
        err.kind,
        AppErrorKind::IllegalStateTransition {
            from: TransactionStatus::Paid,
            ..
        }
    ));
    assert_eq!(status_of(&h.store, "CAN3").await, TransactionStatus::Paid);

    let err = h.orchestrator.cancel_pending("NOPE").await.unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::NotFound { .. }));
}

#[tokio::test]
async fn concurrent_duplicate_callbacks_pay_once() {
    let h = harness();
    h.orchestrator
        .create_payment("RACE1", BigDecimal::from(100000), "VNPAY")
        .await
        .unwrap();

    let params = Arc::new(signed_callback("RACE1", 10_000_000, "00", "14000040"));
    let tasks = (0..16).map(|i| {
        let orchestrator = h.orchestrator.clone();
        let params = params.clone();
        let channel = if i % 2 == 0 {
            CallbackChannel::Notification
        } else {
            CallbackChannel::Return
        };
        tokio::spawn(async move {
            orchestrator
                .handle_callback("VNPAY", &params, channel)
                .await
                .unwrap()
        })
    });

    let outcomes: Vec<CallbackOutcome> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    let confirmed = outcomes
        .iter()
        .filter(|o| matches!(o, CallbackOutcome::Confirmed(_)))
        .count();
    assert_eq!(confirmed, 1);
    assert!(outcomes.iter().all(|o| o.transaction().status == TransactionStatus::Paid));
    assert_eq!(h.sink.count(), 1);
}

#[tokio::test]
async fn callback_racing_sweeper_resolves_to_one_outcome() {
    let h = harness();
    // Still payable for the callback, already stale for a sweep run in the future.
    insert_pending(&h.store, "RACE2", 1).await;

    let sweeper = ExpirySweeper::new(h.store.clone(), SweeperConfig::default());
    let params = signed_callback("RACE2", 10_000_000, "00", "14000050");

    let sweep = sweeper.sweep_once(Utc::now() + ChronoDuration::minutes(5));
    let callback = h
        .orchestrator
        .handle_callback("VNPAY", &params, CallbackChannel::Notification);
    let (sweep, callback) = tokio::join!(sweep, callback);
    let sweep = sweep.unwrap();

    let final_status = status_of(&h.store, "RACE2").await;
    match final_status {
        TransactionStatus::Paid => {
            assert!(sweep.expired.is_empty());
            assert_eq!(h.sink.count(), 1);
        }
        TransactionStatus::Expired => {
            assert_eq!(sweep.expired, vec!["RACE2".to_string()]);
            assert!(matches!(callback, Ok(CallbackOutcome::AlreadyProcessed(_))));
            assert_eq!(h.sink.count(), 0);
        }
        other => panic!("unexpected final status {}", other),
    }
}

#[tokio::test]
async fn create_amount_with_extreme_exponent_is_rejected() {
    let h = harness();

    let err = h
        .orchestrator
        .create_payment("ORD8", BigDecimal::from_str("1e-100000000").unwrap(), "VNPAY")
        .await
        .unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::Validation { .. }));
    assert_eq!(err.status_code(), 400);

    let err = h
        .orchestrator
        .create_payment("ORD8", BigDecimal::from_str("1e100000000").unwrap(), "VNPAY")
        .await
        .unwrap_err();
    assert!(matches!(err.kind, AppErrorKind::Validation { .. }));
    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn unreachable_gateway_fails_fast_and_persists_nothing() {
    let gateway = Arc::new(UnreachableGateway::default());
    let mut registry = ProviderRegistry::new();
    registry.register(
        gateway.clone(),
        GatewayConfig {
            timeout: Duration::from_secs(1),
            max_retries: 0,
            retry_backoff: Duration::from_millis(1),
            breaker_failures: 2,
            breaker_reset: Duration::from_secs(60),
        },
    );
    let store = Arc::new(InMemoryTransactionStore::new());
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = PaymentOrchestrator::new(registry, store.clone(), sink.clone());

    for order_id in ["GW1", "GW2"] {
        let err = orchestrator
            .create_payment(order_id, BigDecimal::from(100000), "VNPAY")
            .await
            .unwrap_err();
        assert!(matches!(err.kind, AppErrorKind::GatewayUnavailable { .. }));
        assert_eq!(err.status_code(), 503);
        assert!(err.is_retryable());
    }
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
    assert!(orchestrator
        .registry()
        .circuit_states()
        .iter()
        .any(|(_, state)| *state == "open"));

    // Open circuit: the gateway is not contacted at all.
    let err = orchestrator
        .create_payment("GW3", BigDecimal::from(100000), "VNPAY")
        .await
        .unwrap_err();
    match &err.kind {
        AppErrorKind::GatewayUnavailable { message, .. } => {
            assert!(message.contains("Circuit breaker open"))
        }
        other => panic!("expected GatewayUnavailable, got {:?}", other),
    }
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);

    assert!(store.is_empty().await);
    assert_eq!(sink.count(), 0);
}
