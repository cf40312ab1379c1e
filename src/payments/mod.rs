pub mod error;
pub mod factory;
pub mod provider;
pub mod providers;
pub mod signature;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use factory::ProviderRegistry;
pub use provider::PaymentProvider;
pub use types::{CallbackChannel, CallbackParams, ProviderName};
