use crate::config::ConfigError;
use crate::payments::provider::PaymentProvider;
use crate::payments::providers::{VnPayConfig, VnPayProvider};
use crate::payments::types::ProviderName;
use crate::payments::utils::{GatewayConfig, GatewayGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// A gateway client together with the guard that bounds calls to it.
#[derive(Clone)]
pub struct ProviderEntry {
    pub provider: Arc<dyn PaymentProvider>,
    pub guard: GatewayGuard,
}

/// Provider tag to gateway client, assembled once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: HashMap<ProviderName, ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(vnpay: VnPayConfig, gateway: GatewayConfig) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        registry.register(Arc::new(VnPayProvider::new(vnpay)?), gateway);
        Ok(registry)
    }

    /// Replaces any provider already registered under the same name.
    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>, gateway: GatewayConfig) {
        let name = provider.name();
        let guard = GatewayGuard::new(name.as_str(), gateway);
        self.entries.insert(name, ProviderEntry { provider, guard });
    }

    pub fn get(&self, name: ProviderName) -> Option<&ProviderEntry> {
        self.entries.get(&name)
    }

    pub fn list_available_providers(&self) -> Vec<ProviderName> {
        let mut names: Vec<ProviderName> = self.entries.keys().copied().collect();
        names.sort_by_key(|n| n.as_str());
        names
    }

    pub fn circuit_states(&self) -> Vec<(ProviderName, &'static str)> {
        self.list_available_providers()
            .into_iter()
            .filter_map(|name| self.get(name).map(|e| (name, e.guard.circuit_state())))
            .collect()
    }
}
