//! Payment gateway service: VNPay checkout, signed callback handling and the
//! transaction lifecycle behind them.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
