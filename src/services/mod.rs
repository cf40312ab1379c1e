//! Business logic: the transaction lifecycle and the payment workflow built on it.

pub mod notification;
pub mod payment_orchestrator;
pub mod transaction_state;

pub use notification::{EventSink, NotificationService, TransactionEvent};
pub use payment_orchestrator::{CallbackOutcome, CreateOutcome, PaymentOrchestrator};
pub use transaction_state::{StateError, TransactionStateMachine, TransactionStatus};
