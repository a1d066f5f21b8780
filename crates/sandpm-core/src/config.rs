use crate::error::Error;
use crate::pkg::policy::InstallPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// Environment variable to override the registry URL.
pub const REGISTRY_ENV: &str = "SANDPM_NPM_REGISTRY";

/// How long fetched registry metadata stays fresh.
pub const DEFAULT_METADATA_TTL: Duration = Duration::from_secs(5 * 60);

/// Runtime configuration for a [`crate::PackageManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmConfig {
    /// Base URL of the npm-compatible registry.
    pub registry_url: String,

    /// Expiry window for cached metadata.
    pub metadata_ttl: Duration,

    /// TCP connect timeout for registry requests.
    pub connect_timeout: Duration,

    /// Total timeout for a single registry request.
    pub request_timeout: Duration,

    /// User-Agent header sent to the registry.
    pub user_agent: String,

    /// Working directory used when an install does not name one.
    pub default_cwd: PathBuf,

    /// Gate applied in front of every install.
    pub policy: InstallPolicy,
}

impl Default for PmConfig {
    fn default() -> Self {
        Self {
            registry_url: DEFAULT_REGISTRY.to_string(),
            metadata_ttl: DEFAULT_METADATA_TTL,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            user_agent: concat!("sandpm/", env!("CARGO_PKG_VERSION")).to_string(),
            default_cwd: PathBuf::from("/"),
            policy: InstallPolicy::sandboxed(),
        }
    }
}

impl PmConfig {
    /// Default config with the registry taken from `SANDPM_NPM_REGISTRY` when set.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(REGISTRY_ENV) {
            if !url.trim().is_empty() {
                config.registry_url = url.trim().to_string();
            }
        }
        config
    }

    /// Set the registry URL.
    #[must_use]
    pub fn with_registry(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into();
        self
    }

    /// Set the metadata expiry window.
    #[must_use]
    pub fn with_metadata_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_ttl = ttl;
        self
    }

    /// Set the default working directory.
    #[must_use]
    pub fn with_default_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.default_cwd = cwd.into();
        self
    }

    /// Set the install policy.
    #[must_use]
    pub fn with_policy(mut self, policy: InstallPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Parse the registry URL, normalized to end with `/` so names join under it.
    pub fn registry_base(&self) -> Result<Url, Error> {
        normalize_registry_url(&self.registry_url)
    }
}

/// Parse a registry URL and make sure it ends with a trailing slash.
pub fn normalize_registry_url(raw: &str) -> Result<Url, Error> {
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&with_slash).map_err(|source| Error::RegistryUrl {
        url: raw.to_string(),
        source,
    })
}
