use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::Gateway;
use crate::config::{GatewayConfig, GatewaySettings, ProviderConfig, ProviderRegistry, ResolvedProvider};
use crate::drivers::ProviderAdapter;
use crate::persistence::{noop_persistence, PersistenceSink};
use crate::relay::StreamingRelay;
use crate::resilience::{CircuitBreaker, ProtectionService, RateLimiter};
use crate::session::SessionCoordinator;
use crate::telemetry::{tracing_observer, ProtectionObserver};
use crate::Result;

/// Builder for creating a gateway with custom configuration.
///
/// Keep this surface area small and predictable. Providers come from a
/// config document, a config file, or individual entries; all of them end up
/// in one validated registry.
pub struct GatewayBuilder {
    config: Option<GatewayConfig>,
    config_path: Option<PathBuf>,
    providers: Vec<ProviderConfig>,
    custom: Vec<ResolvedProvider>,
    settings: Option<GatewaySettings>,
    hard_timeout: Option<Duration>,
    lease_grace: Option<Duration>,
    observer: Option<Arc<dyn ProtectionObserver>>,
    persistence: Option<Arc<dyn PersistenceSink>>,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            config_path: None,
            providers: Vec::new(),
            custom: Vec::new(),
            settings: None,
            hard_timeout: None,
            lease_grace: None,
            observer: None,
            persistence: None,
            breaker: None,
            limiter: None,
        }
    }

    /// Use an already parsed config document.
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Load the config document from a YAML or JSON file at build time.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Add one provider on top of the config document.
    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.push(provider);
        self
    }

    /// Add a provider served by a custom adapter instead of the HTTP one.
    pub fn provider_with_adapter(
        mut self,
        config: ProviderConfig,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        self.custom.push(ResolvedProvider::with_adapter(config, adapter));
        self
    }

    /// Replace the document's gateway settings. Environment overrides are not
    /// applied to explicit settings.
    pub fn settings(mut self, settings: GatewaySettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn session_hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = Some(timeout);
        self
    }

    pub fn session_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = Some(grace);
        self
    }

    /// Inject a protection observer. Default logs through `tracing`.
    pub fn observer(mut self, observer: Arc<dyn ProtectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Inject the persistence collaborator. Default discards messages.
    pub fn persistence(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.persistence = Some(sink);
        self
    }

    /// Share a breaker registry with another gateway instance.
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Share a rate limiter with another gateway instance.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Build the gateway.
    pub fn build(self) -> Result<Gateway> {
        let mut config = match (self.config, self.config_path) {
            (Some(config), _) => config,
            (None, Some(path)) => GatewayConfig::from_path(&path)?,
            (None, None) => GatewayConfig::default(),
        };
        config.providers.extend(self.providers);

        let mut settings = match self.settings {
            Some(settings) => settings,
            None => config.gateway.clone().with_env_overrides(),
        };
        if let Some(timeout) = self.hard_timeout {
            settings.session_hard_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(grace) = self.lease_grace {
            settings.session_lease_grace_ms = grace.as_millis() as u64;
        }
        config.gateway = settings.clone();

        let registry = Arc::new(ProviderRegistry::new());
        registry.apply(&config)?;
        for provider in self.custom {
            registry.insert(provider);
        }

        let sessions = Arc::new(SessionCoordinator::new(
            settings.session_hard_timeout(),
            settings.session_lease_grace(),
        ));
        let protection = ProtectionService::new(
            self.breaker
                .unwrap_or_else(|| Arc::new(CircuitBreaker::new())),
            self.limiter.unwrap_or_else(|| Arc::new(RateLimiter::new())),
            self.observer.unwrap_or_else(tracing_observer),
        );
        let relay = StreamingRelay::new(
            protection,
            self.persistence.unwrap_or_else(noop_persistence),
        )
        .with_terminal_send_timeout(settings.session_lease_grace() / 2);

        tracing::info!(
            providers = registry.len(),
            session_hard_timeout_ms = settings.session_hard_timeout_ms,
            "gateway ready"
        );
        Ok(Gateway::from_parts(registry, sessions, relay, settings))
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::AdapterKind;

    #[test]
    fn test_builder_merges_document_and_entries() {
        let doc = GatewayConfig::from_yaml_str(
            "providers:\n  - identity: a\n    adapter: dify\n    endpoint: http://127.0.0.1:9/v1/chat-messages\n",
        )
        .unwrap();
        let gw = GatewayBuilder::new()
            .config(doc)
            .provider(ProviderConfig::new(
                "b",
                AdapterKind::Anthropic,
                "http://127.0.0.1:9/v1/messages",
            ))
            .session_hard_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(gw.registry().identities(), vec!["a".into(), "b".into()]);
        assert_eq!(gw.settings().session_hard_timeout_ms, 5_000);
    }

    #[test]
    fn test_invalid_provider_fails_build() {
        let mut p = ProviderConfig::new("a", AdapterKind::OpenAi, "http://127.0.0.1:9");
        p.retry.max_attempts = 0;
        assert!(GatewayBuilder::new().provider(p).build().is_err());
    }
}
