//! Health check module
//! Provides health status for the transaction store and the gateway circuits

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::api::AppState;
use crate::database::transaction_repository::TransactionStore;
use crate::payments::factory::ProviderRegistry;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    store: Arc<dyn TransactionStore>,
    registry: ProviderRegistry,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn TransactionStore>, registry: ProviderRegistry) -> Self {
        Self { store, registry }
    }

    /// An unreachable store makes the service unhealthy; an open gateway
    /// circuit only degrades it.
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut store_healthy = true;
        let mut circuits_closed = true;

        let start = Instant::now();
        match timeout(Duration::from_secs(5), self.store.health_check()).await {
            Ok(Ok(())) => {
                let elapsed = start.elapsed().as_millis();
                health_status
                    .checks
                    .insert("store".to_string(), ComponentHealth::up(Some(elapsed)));
                info!("Store health check: OK ({}ms)", elapsed);
            }
            Ok(Err(e)) => {
                store_healthy = false;
                health_status.checks.insert(
                    "store".to_string(),
                    ComponentHealth::down(Some(e.to_string())),
                );
                error!("Store health check failed: {}", e);
            }
            Err(_) => {
                store_healthy = false;
                health_status.checks.insert(
                    "store".to_string(),
                    ComponentHealth::down(Some("Timeout".to_string())),
                );
                error!("Store health check timed out");
            }
        }

        for (provider, state) in self.registry.circuit_states() {
            let key = format!("gateway_{}", provider.as_str().to_lowercase());
            let component = if state == "closed" {
                ComponentHealth::up(None)
            } else {
                circuits_closed = false;
                warn!(provider = %provider, circuit = state, "Gateway circuit is not closed");
                ComponentHealth::warning(None, Some(format!("circuit {}", state)))
            };
            health_status.checks.insert(key, component);
        }

        health_status.status = match (store_healthy, circuits_closed) {
            (false, _) => HealthState::Unhealthy,
            (true, false) => HealthState::Degraded,
            (true, true) => HealthState::Healthy,
        };

        health_status
    }
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthStatus>) {
    let orchestrator = &state.orchestrator;
    let checker = HealthChecker::new(orchestrator.store(), orchestrator.registry().clone());
    let status = checker.check_health().await;

    let code = match status.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(status))
}
