//! Live provider table with atomic hot swap.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::{GatewayConfig, ProviderConfig};
use crate::drivers::ProviderAdapter;
use crate::resilience::ProtectionPolicy;
use crate::types::ProviderIdentity;
use crate::Result;

/// One provider as seen by a request: its configuration, the protection
/// limits derived from it, and a ready adapter.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub config: ProviderConfig,
    pub policy: ProtectionPolicy,
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl ResolvedProvider {
    /// Build the HTTP adapter described by `config`.
    pub fn from_config(config: ProviderConfig) -> Result<Self> {
        let adapter = config.build_adapter()?;
        Ok(Self::with_adapter(config, adapter))
    }

    /// Pair `config` with a caller-supplied adapter.
    pub fn with_adapter(config: ProviderConfig, adapter: Arc<dyn ProviderAdapter>) -> Self {
        let policy = config.policy();
        Self {
            config,
            policy,
            adapter,
        }
    }

    pub fn identity(&self) -> &ProviderIdentity {
        &self.config.identity
    }
}

type ProviderTable = HashMap<ProviderIdentity, Arc<ResolvedProvider>>;

/// Hot-reloadable provider registry.
///
/// Lookups return an `Arc` of the entry, so a request that resolved its
/// provider keeps using that entry even if a reload replaces it meanwhile.
pub struct ProviderRegistry {
    providers: ArcSwap<ProviderTable>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.identities())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Validate `config`, build every adapter, then replace the whole table.
    ///
    /// Nothing changes unless every provider builds; on error the previous
    /// table stays live.
    pub fn apply(&self, config: &GatewayConfig) -> Result<usize> {
        config.validate()?;
        let mut table = HashMap::with_capacity(config.providers.len());
        for provider in &config.providers {
            let resolved = ResolvedProvider::from_config(provider.clone())?;
            table.insert(provider.identity.clone(), Arc::new(resolved));
        }
        let count = table.len();
        self.providers.store(Arc::new(table));
        Ok(count)
    }

    /// Add or replace a single entry, keeping the rest.
    pub fn insert(&self, provider: ResolvedProvider) {
        let provider = Arc::new(provider);
        self.providers.rcu(|current| {
            let mut updated = ProviderTable::clone(current);
            updated.insert(provider.identity().clone(), Arc::clone(&provider));
            updated
        });
    }

    pub fn remove(&self, identity: &str) -> bool {
        if !self.providers.load().contains_key(identity) {
            return false;
        }
        self.providers.rcu(|current| {
            let mut updated = ProviderTable::clone(current);
            updated.remove(identity);
            updated
        });
        true
    }

    pub fn get(&self, identity: &str) -> Option<Arc<ResolvedProvider>> {
        self.providers.load().get(identity).cloned()
    }

    /// Configured identities, sorted.
    pub fn identities(&self) -> Vec<ProviderIdentity> {
        let mut ids: Vec<_> = self.providers.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.providers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
