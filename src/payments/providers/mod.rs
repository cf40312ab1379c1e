pub mod vnpay;

pub use vnpay::{VnPayConfig, VnPayProvider};
