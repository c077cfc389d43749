//! 配置模块：网关设置与每个 provider 的配置面，支持 YAML/JSON 与热重载。
//!
//! A [`GatewayConfig`] document names every backend the gateway may call and
//! the limits that apply to it:
//!
//! ```yaml
//! gateway:
//!   session_hard_timeout_ms: 300000
//! providers:
//!   - identity: "fastgpt:agent-7"
//!     adapter: fastgpt
//!     endpoint: "https://fastgpt.example.com/api/v1/chat/completions"
//!     credentials: { api_key_env: FASTGPT_KEY }
//!     breaker_threshold: 5
//!     breaker_cooldown_ms: 30000
//!     rate_limit: { window_ms: 60000, max: 20 }
//!     retry: { max_attempts: 3, base_delay_ms: 200, cap_ms: 5000 }
//! ```
//!
//! Validation runs before a document is applied. The live table lives in
//! [`ProviderRegistry`]; [`ConfigWatcher`] re-applies the file when it changes.

pub mod registry;
pub mod watcher;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::drivers::{AdapterKind, Codec, CodecSettings, HttpAdapter, ProviderAdapter};
use crate::error::{Error, ErrorContext};
use crate::resilience::rate_limiter::MAX_LIMIT;
use crate::resilience::{CircuitBreakerConfig, ProtectionPolicy, RateLimiterConfig, RetryPolicy};
use crate::transport::{HttpTransport, TransportSettings};
use crate::types::ProviderIdentity;
use crate::Result;

pub use registry::{ProviderRegistry, ResolvedProvider};
pub use watcher::{reload_into, ConfigWatcher, ReloadEvent};

const VALIDATOR: &str = "config_validator";

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl GatewayConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a document from disk. `.json` files are read as JSON, anything
    /// else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    /// Check every provider entry and reject duplicate identities.
    pub fn validate(&self) -> Result<()> {
        self.gateway.validate()?;
        let mut seen = HashSet::new();
        for (index, provider) in self.providers.iter().enumerate() {
            provider.validate(index)?;
            if !seen.insert(provider.identity.clone()) {
                return Err(Error::configuration_with_context(
                    format!("duplicate provider identity '{}'", provider.identity),
                    ErrorContext::new()
                        .with_field_path(format!("providers[{index}].identity"))
                        .with_source(VALIDATOR),
                ));
            }
        }
        Ok(())
    }

    pub fn provider(&self, identity: &str) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.identity.as_str() == identity)
    }
}

/// Process-wide knobs that do not belong to any single provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Longest a single turn may hold its conversation lock.
    pub session_hard_timeout_ms: u64,
    /// How long a timed-out turn gets to wind down after cancellation.
    pub session_lease_grace_ms: u64,
    /// Idle time after which breaker cells, rate-limit buckets and unlocked
    /// session records are dropped.
    pub idle_ttl_ms: u64,
    pub maintenance_interval_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            session_hard_timeout_ms: 300_000,
            session_lease_grace_ms: 30_000,
            idle_ttl_ms: 600_000,
            maintenance_interval_ms: 60_000,
        }
    }
}

impl GatewaySettings {
    /// Apply environment overrides:
    /// - `AI_GATEWAY_SESSION_HARD_TIMEOUT_MS`
    /// - `AI_GATEWAY_IDLE_TTL_MS`
    /// - `AI_GATEWAY_MAINTENANCE_INTERVAL_MS`
    pub fn with_env_overrides(mut self) -> Self {
        fn env_ms(name: &str) -> Option<u64> {
            std::env::var(name)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
        }
        if let Some(ms) = env_ms("AI_GATEWAY_SESSION_HARD_TIMEOUT_MS") {
            self.session_hard_timeout_ms = ms;
        }
        if let Some(ms) = env_ms("AI_GATEWAY_IDLE_TTL_MS") {
            self.idle_ttl_ms = ms;
        }
        if let Some(ms) = env_ms("AI_GATEWAY_MAINTENANCE_INTERVAL_MS") {
            self.maintenance_interval_ms = ms;
        }
        self
    }

    pub fn session_hard_timeout(&self) -> Duration {
        Duration::from_millis(self.session_hard_timeout_ms)
    }

    pub fn session_lease_grace(&self) -> Duration {
        Duration::from_millis(self.session_lease_grace_ms)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("session_hard_timeout_ms", self.session_hard_timeout_ms),
            ("idle_ttl_ms", self.idle_ttl_ms),
            ("maintenance_interval_ms", self.maintenance_interval_ms),
        ] {
            if value == 0 {
                return Err(positive_required(format!("gateway.{field}")));
            }
        }
        Ok(())
    }
}

/// API credentials. Either an inline key or the name of an environment
/// variable holding it; an inline key wins when both are set.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .finish()
    }
}

impl Credentials {
    pub fn inline(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            api_key_env: None,
        }
    }

    /// Resolve the key. A named but unset environment variable is a
    /// configuration error; no credentials at all is allowed (self-hosted
    /// backends).
    pub fn resolve(&self) -> Result<Option<String>> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(Some(key.clone()));
        }
        match &self.api_key_env {
            Some(var) => match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => Ok(Some(key.trim().to_string())),
                _ => Err(Error::configuration_with_context(
                    format!("environment variable '{var}' is not set"),
                    ErrorContext::new()
                        .with_field_path("credentials.api_key_env")
                        .with_source("credentials"),
                )),
            },
            None => Ok(None),
        }
    }
}

/// Fixed-window quota per caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            cap_ms: 5_000,
        }
    }
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

/// Everything the gateway needs to call one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub identity: ProviderIdentity,
    pub adapter: AdapterKind,
    pub endpoint: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Model sent when the request does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Extra headers sent with every request.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    /// Total deadline for non-streaming calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Longest gap allowed between two stream chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_idle_timeout_ms: Option<u64>,
}

impl ProviderConfig {
    pub fn new(identity: impl Into<ProviderIdentity>, adapter: AdapterKind, endpoint: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            adapter,
            endpoint: endpoint.into(),
            credentials: Credentials::default(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            model: None,
            headers: HashMap::new(),
            connect_timeout_ms: None,
            request_timeout_ms: None,
            stream_idle_timeout_ms: None,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.breaker_threshold)
            .with_cooldown(Duration::from_millis(self.breaker_cooldown_ms))
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::new(
            Duration::from_millis(self.rate_limit.window_ms),
            self.rate_limit.max,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.cap_ms),
        )
    }

    pub fn policy(&self) -> ProtectionPolicy {
        ProtectionPolicy {
            breaker: self.breaker_config(),
            rate_limit: self.rate_limiter_config(),
            retry: self.retry_policy(),
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        let mut settings = TransportSettings::default();
        if let Some(ms) = self.connect_timeout_ms {
            settings.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.request_timeout_ms {
            settings.request_timeout = Duration::from_millis(ms);
        }
        settings
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        self.stream_idle_timeout_ms.map(Duration::from_millis)
    }

    /// Resolve credentials and build the codec settings.
    pub fn codec_settings(&self) -> Result<CodecSettings> {
        Ok(CodecSettings {
            endpoint: self.endpoint.clone(),
            api_key: self.credentials.resolve()?,
            model: self.model.clone(),
            headers: self.headers.clone(),
        })
    }

    /// Build the HTTP adapter for this provider.
    pub fn build_adapter(&self) -> Result<Arc<dyn ProviderAdapter>> {
        let codec = Codec::new(self.adapter, self.codec_settings()?);
        let transport = HttpTransport::new(self.transport_settings())?;
        Ok(Arc::new(HttpAdapter::new(
            codec,
            transport,
            self.stream_idle_timeout(),
        )))
    }

    fn validate(&self, index: usize) -> Result<()> {
        let field = |name: &str| format!("providers[{index}].{name}");

        if self.identity.as_str().trim().is_empty() {
            return Err(Error::configuration_with_context(
                "provider identity must not be empty",
                ErrorContext::new()
                    .with_field_path(field("identity"))
                    .with_source(VALIDATOR),
            ));
        }

        match url::Url::parse(&self.endpoint) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
            Ok(u) => {
                return Err(Error::configuration_with_context(
                    format!("unsupported endpoint scheme '{}'", u.scheme()),
                    ErrorContext::new()
                        .with_field_path(field("endpoint"))
                        .with_source(VALIDATOR),
                ))
            }
            Err(e) => {
                return Err(Error::configuration_with_context(
                    "endpoint is not a valid URL",
                    ErrorContext::new()
                        .with_field_path(field("endpoint"))
                        .with_details(e.to_string())
                        .with_source(VALIDATOR),
                ))
            }
        }

        if self.breaker_threshold == 0 {
            return Err(positive_required(field("breaker_threshold")));
        }
        if self.breaker_cooldown_ms == 0 {
            return Err(positive_required(field("breaker_cooldown_ms")));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(positive_required(field("rate_limit.window_ms")));
        }
        if self.rate_limit.max == 0 || self.rate_limit.max > MAX_LIMIT {
            return Err(Error::configuration_with_context(
                format!("rate limit must be between 1 and {MAX_LIMIT}"),
                ErrorContext::new()
                    .with_field_path(field("rate_limit.max"))
                    .with_details(format!("got {}", self.rate_limit.max))
                    .with_source(VALIDATOR),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(positive_required(field("retry.max_attempts")));
        }
        if self.retry.cap_ms < self.retry.base_delay_ms {
            return Err(Error::configuration_with_context(
                "retry cap must not be below the base delay",
                ErrorContext::new()
                    .with_field_path(field("retry.cap_ms"))
                    .with_source(VALIDATOR),
            ));
        }
        if self.stream_idle_timeout_ms == Some(0) {
            return Err(positive_required(field("stream_idle_timeout_ms")));
        }
        Ok(())
    }
}

fn positive_required(field_path: String) -> Error {
    Error::configuration_with_context(
        "value must be positive",
        ErrorContext::new()
            .with_field_path(field_path)
            .with_source(VALIDATOR),
    )
}
