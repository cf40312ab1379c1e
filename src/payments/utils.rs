use crate::config::{env_or, ConfigError};
use crate::payments::error::{PaymentError, PaymentResult};
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Limits applied to every outbound gateway call.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub breaker_failures: u32,
    pub breaker_reset: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff: Duration::from_millis(200),
            breaker_failures: 5,
            breaker_reset: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            timeout: Duration::from_secs(env_or(
                "GATEWAY_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            max_retries: env_or("GATEWAY_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff: Duration::from_millis(env_or(
                "GATEWAY_RETRY_BACKOFF_MS",
                defaults.retry_backoff.as_millis() as u64,
            )?),
            breaker_failures: env_or("GATEWAY_BREAKER_FAILURES", defaults.breaker_failures)?,
            breaker_reset: Duration::from_secs(env_or(
                "GATEWAY_BREAKER_RESET_SECS",
                defaults.breaker_reset.as_secs(),
            )?),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "GATEWAY_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        if self.breaker_failures == 0 {
            return Err(ConfigError::InvalidValue(
                "GATEWAY_BREAKER_FAILURES must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timeout, bounded retry and circuit breaking around a gateway call.
///
/// Each attempt is reported to a consecutive-failures breaker. Only retryable
/// errors count as breaker failures, so a rejected amount never opens the circuit.
/// Once open, calls fail immediately with [`PaymentError::CircuitOpen`].
#[derive(Clone)]
pub struct GatewayGuard {
    provider: String,
    config: GatewayConfig,
    breaker: Breaker,
}

impl GatewayGuard {
    pub fn new(provider: impl Into<String>, config: GatewayConfig) -> Self {
        let backoff = backoff::equal_jittered(config.breaker_reset, config.breaker_reset * 2);
        let policy = failure_policy::consecutive_failures(config.breaker_failures, backoff);
        let breaker = Config::new().failure_policy(policy).build();

        Self {
            provider: provider.into(),
            config,
            breaker,
        }
    }

    pub fn circuit_state(&self) -> &'static str {
        if self.breaker.is_call_permitted() {
            "closed"
        } else {
            "open"
        }
    }

    pub async fn call<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> PaymentResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PaymentResult<T>>,
    {
        let mut attempt = 0_u32;
        loop {
            let timeout = self.config.timeout;
            let fut = attempt_fn();
            let result = self
                .breaker
                .call_with(
                    |e: &PaymentError| e.is_retryable(),
                    async move {
                        match tokio::time::timeout(timeout, fut).await {
                            Ok(inner) => inner,
                            Err(_) => Err(PaymentError::Timeout {
                                timeout_ms: timeout.as_millis() as u64,
                            }),
                        }
                    },
                )
                .await;

            let err = match result {
                Ok(value) => return Ok(value),
                Err(FailsafeError::Rejected) => {
                    warn!(
                        provider = %self.provider,
                        operation = operation,
                        "gateway circuit open, failing fast"
                    );
                    return Err(PaymentError::CircuitOpen {
                        provider: self.provider.clone(),
                    });
                }
                Err(FailsafeError::Inner(e)) => e,
            };

            if !err.is_retryable() || attempt >= self.config.max_retries {
                return Err(err);
            }

            let delay = retry_delay(self.config.retry_backoff, attempt);
            warn!(
                provider = %self.provider,
                operation = operation,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "gateway call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2_u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

pub fn hmac_sha512_hex(secret: &[u8], payload: &[u8]) -> PaymentResult<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha512;

    type HmacSha512 = Hmac<Sha512>;
    let mut mac =
        HmacSha512::new_from_slice(secret).map_err(|e| PaymentError::WebhookVerificationError {
            message: format!("invalid HMAC key: {}", e),
        })?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
