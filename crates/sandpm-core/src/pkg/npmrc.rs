//! `.npmrc` support.
//!
//! Recognized directives:
//! - `registry=URL` replaces the default registry
//! - `@scope:registry=URL` routes a scope to another registry
//! - `//host/path/:_authToken=TOKEN` attaches a bearer token to a registry
//!
//! Anything else is ignored, as are comments (`#`, `;`) and blank lines.

use crate::config::normalize_registry_url;
use crate::vfs::VirtualFs;
use std::collections::BTreeMap;
use std::path::Path;
use url::Url;

/// Parsed `.npmrc` configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NpmrcConfig {
    /// Default registry override.
    pub registry: Option<Url>,
    /// Scope (with `@`) -> registry URL.
    pub scoped_registries: BTreeMap<String, Url>,
    /// `host[/path]` -> auth token.
    pub auth_tokens: BTreeMap<String, String>,
}

impl NpmrcConfig {
    /// Whether the file configured nothing we use.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_none() && self.scoped_registries.is_empty() && self.auth_tokens.is_empty()
    }

    /// Look up the token for a registry URL, preferring `host/path` over `host`.
    ///
    /// A non-default port is part of the host, as in `//localhost:4873/:_authToken`.
    #[must_use]
    pub fn token_for(&self, registry: &Url) -> Option<&str> {
        let host = match registry.port() {
            Some(port) => format!("{}:{port}", registry.host_str()?),
            None => registry.host_str()?.to_string(),
        };
        let path = registry.path().trim_end_matches('/');
        let with_path = format!("{host}{path}");
        self.auth_tokens
            .get(&with_path)
            .or_else(|| self.auth_tokens.get(&host))
            .map(String::as_str)
    }
}

/// Parse the content of one `.npmrc` file.
#[must_use]
pub fn parse_npmrc(content: &str) -> NpmrcConfig {
    let mut config = NpmrcConfig::default();

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        if key == "registry" {
            config.registry = normalize_registry_url(value).ok();
        } else if let Some(scope) = key.strip_suffix(":registry") {
            if scope.starts_with('@') && scope.len() > 1 {
                if let Ok(url) = normalize_registry_url(value) {
                    config.scoped_registries.insert(scope.to_string(), url);
                }
            }
        } else if let Some(target) = key
            .strip_prefix("//")
            .and_then(|k| k.strip_suffix(":_authToken"))
        {
            let target = target.trim_end_matches('/');
            if !target.is_empty() && !value.is_empty() {
                config
                    .auth_tokens
                    .insert(target.to_string(), value.to_string());
            }
        }
    }

    config
}

/// Read `{cwd}/.npmrc` from the virtual filesystem.
///
/// A missing or unreadable file yields an empty config.
#[must_use]
pub fn load_npmrc(vfs: &dyn VirtualFs, cwd: &Path) -> NpmrcConfig {
    let path = cwd.join(".npmrc");
    if !vfs.exists(&path) {
        return NpmrcConfig::default();
    }
    vfs.read_file(&path)
        .map(|bytes| parse_npmrc(&String::from_utf8_lossy(&bytes)))
        .unwrap_or_default()
}
