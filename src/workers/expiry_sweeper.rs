use crate::config::{env_or, ConfigError};
use crate::database::error::DatabaseError;
use crate::database::transaction_repository::TransactionStore;
use crate::services::transaction_state::{TransactionStateMachine, TransactionStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound on back-to-back full batches in one cycle.
const MAX_BATCHES_PER_CYCLE: usize = 20;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Maximum number of expired rows fetched per batch.
    pub batch_size: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            batch_size: 500,
        }
    }
}

impl SweeperConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: env_or("EXPIRY_SWEEP_ENABLED", defaults.enabled)?,
            interval: Duration::from_secs(env_or(
                "EXPIRY_SWEEP_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            batch_size: env_or("EXPIRY_SWEEP_BATCH_SIZE", defaults.batch_size)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "EXPIRY_SWEEP_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }
        if self.batch_size <= 0 {
            return Err(ConfigError::InvalidValue(
                "EXPIRY_SWEEP_BATCH_SIZE must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: Vec<String>,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Moves PENDING transactions past their deadline to EXPIRED.
///
/// The batch update is conditioned on the row still being PENDING, so a
/// callback that already moved an order to PAID is never overwritten.
pub struct ExpirySweeper {
    store: Arc<dyn TransactionStore>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn TransactionStore>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "expiry sweeper started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("expiry sweeper stopping");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        warn!(error = %e, "expiry sweep cycle failed");
                    }
                }
            }
        }

        info!("expiry sweeper stopped");
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, DatabaseError> {
        let mut report = SweepReport::default();

        for _ in 0..MAX_BATCHES_PER_CYCLE {
            let candidates = self
                .store
                .find_expired_pending(now, self.config.batch_size)
                .await?;
            let fetched = candidates.len();
            report.scanned += fetched;

            let order_ids: Vec<String> = candidates
                .into_iter()
                .filter_map(|mut tx| {
                    TransactionStateMachine::transition(&mut tx, TransactionStatus::Expired)
                        .map(|_| tx.order_id)
                        .ok()
                })
                .collect();

            let expired = self.store.expire_pending(&order_ids, now).await?;
            for order_id in &expired {
                debug!(
                    order_id = %order_id,
                    from_status = %TransactionStatus::Pending,
                    to_status = %TransactionStatus::Expired,
                    "transaction expired by sweeper"
                );
            }
            let batch_expired = expired.len();
            report.expired.extend(expired);

            // A short batch, or one where nothing could be expired, ends the cycle.
            if (fetched as i64) < self.config.batch_size || batch_expired == 0 {
                break;
            }
        }

        if !report.expired.is_empty() {
            info!(
                scanned = report.scanned,
                expired = report.expired.len(),
                "expiry sweep completed"
            );
        }
        Ok(report)
    }
}
