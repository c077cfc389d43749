use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque key identifying one configured backend, e.g. `"fastgpt:agent-7"`.
///
/// Partition key for circuit breakers and signals. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderIdentity(Arc<str>);

impl ProviderIdentity {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderIdentity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProviderIdentity {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl AsRef<str> for ProviderIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for ProviderIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}
