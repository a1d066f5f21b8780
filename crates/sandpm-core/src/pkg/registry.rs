//! npm registry client.

use super::cache::{metadata_key, resolved_key, MetadataCache};
use super::error::PkgError;
use super::metadata::PackageMetadata;
use super::npmrc::NpmrcConfig;
use crate::config::PmConfig;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

type MetadataResult = Result<Arc<PackageMetadata>, PkgError>;
type InflightFetch = Shared<BoxFuture<'static, MetadataResult>>;

/// Fetches currently on the wire, keyed by metadata cache key.
#[derive(Default)]
struct Inflight {
    fetches: Mutex<HashMap<String, InflightFetch>>,
}

impl fmt::Debug for Inflight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Inflight").field("len", &len).finish()
    }
}

/// Registry client for fetching package metadata.
///
/// Responses are cached in a shared [`MetadataCache`] for the configured TTL,
/// and concurrent requests for the same name share a single HTTP request.
/// Clones share the cache, the in-flight table and the fetch counter.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    /// Registry from config; cache keys for it stay unqualified.
    default_base: Url,
    base_url: Url,
    scoped: Arc<BTreeMap<String, Url>>,
    npmrc: Arc<NpmrcConfig>,
    http: Client,
    cache: MetadataCache,
    ttl: Duration,
    inflight: Arc<Inflight>,
    fetches: Arc<AtomicUsize>,
}

impl RegistryClient {
    /// Create a client from config, sharing `cache`.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be created.
    pub fn new(config: &PmConfig, cache: MetadataCache) -> Result<Self, PkgError> {
        let base_url = config
            .registry_base()
            .map_err(|e| PkgError::registry(e.to_string()))?;

        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PkgError::registry(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            default_base: base_url.clone(),
            base_url,
            scoped: Arc::new(BTreeMap::new()),
            npmrc: Arc::new(NpmrcConfig::default()),
            http,
            cache,
            ttl: config.metadata_ttl,
            inflight: Arc::new(Inflight::default()),
            fetches: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Apply `.npmrc` settings: registry override, scoped registries, tokens.
    ///
    /// The returned client keeps sharing this client's cache, in-flight
    /// table and fetch counter.
    #[must_use]
    pub fn with_npmrc(&self, npmrc: &NpmrcConfig) -> Self {
        let mut client = self.clone();
        if let Some(registry) = &npmrc.registry {
            client.base_url = registry.clone();
        }
        client.scoped = Arc::new(npmrc.scoped_registries.clone());
        client.npmrc = Arc::new(npmrc.clone());
        client
    }

    /// Get the default registry URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Number of HTTP requests issued so far (cache hits and coalesced
    /// callers are not counted).
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// The cache this client reads and fills.
    #[must_use]
    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Registry responsible for `name`, honoring scoped registries.
    #[must_use]
    pub fn registry_for(&self, name: &str) -> &Url {
        name.split_once('/')
            .filter(|(scope, _)| scope.starts_with('@'))
            .and_then(|(scope, _)| self.scoped.get(scope))
            .unwrap_or(&self.base_url)
    }

    /// Cache key for the metadata of `name` on the registry serving it.
    ///
    /// Names served by the configured registry use the plain
    /// `metadata:{name}` key. Names routed elsewhere by `.npmrc` get the
    /// registry URL appended, so two registries never share an entry.
    #[must_use]
    pub fn metadata_cache_key(&self, name: &str) -> String {
        self.qualify(metadata_key(name), name)
    }

    /// Cache key for the resolved record of `name`, qualified like
    /// [`Self::metadata_cache_key`].
    #[must_use]
    pub fn resolved_cache_key(&self, name: &str) -> String {
        self.qualify(resolved_key(name), name)
    }

    fn qualify(&self, key: String, name: &str) -> String {
        let registry = self.registry_for(name);
        if *registry == self.default_base {
            key
        } else {
            format!("{key}@{registry}")
        }
    }

    /// URL of the metadata document for `name`.
    pub fn metadata_url(&self, name: &str) -> Result<Url, PkgError> {
        // Scoped names keep the scope but encode the separator.
        let encoded = if name.starts_with('@') {
            name.replace('/', "%2F")
        } else {
            name.to_string()
        };

        self.registry_for(name)
            .join(&encoded)
            .map_err(|e| PkgError::registry(format!("Failed to build URL for '{name}': {e}")))
    }

    /// Fetch the metadata for a package.
    ///
    /// Served from the cache while fresh. Otherwise performs
    /// `GET {registry}/{name}`, joining any identical request already in
    /// flight.
    ///
    /// # Errors
    /// `PKG_REGISTRY_UNAVAILABLE` on a non-2xx response, `PKG_REGISTRY_ERROR`
    /// on transport failures or malformed JSON.
    pub async fn fetch_metadata(&self, name: &str) -> MetadataResult {
        let key = self.metadata_cache_key(name);

        let fetch = {
            let mut inflight = self
                .inflight
                .fetches
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // The cache is read under the in-flight lock: a fetch that
            // completes fills the cache before its entry can be removed.
            if let Some(metadata) = self.cached_metadata(name, &key) {
                return Ok(metadata);
            }
            if let Some(existing) = inflight.get(&key) {
                debug!(name, "Joining in-flight metadata fetch");
                existing.clone()
            } else {
                let client = self.clone();
                let owned = name.to_string();
                let cache_key = key.clone();
                let fetch = async move { client.fetch_uncached(owned, cache_key).await }
                    .boxed()
                    .shared();
                inflight.insert(key.clone(), fetch.clone());
                fetch
            }
        };

        let result = fetch.clone().await;

        let mut inflight = self
            .inflight
            .fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if inflight.get(&key).is_some_and(|f| f.ptr_eq(&fetch)) {
            inflight.remove(&key);
        }

        result
    }

    fn cached_metadata(&self, name: &str, key: &str) -> Option<Arc<PackageMetadata>> {
        let bytes = self.cache.get_fresh(key)?;
        match PackageMetadata::from_slice(&bytes) {
            Ok(metadata) => {
                debug!(name, "Metadata cache hit");
                Some(Arc::new(metadata))
            }
            Err(e) => {
                warn!(name, error = %e, "Discarding unreadable cached metadata");
                self.cache.invalidate(key);
                None
            }
        }
    }

    async fn fetch_uncached(self, name: String, key: String) -> MetadataResult {
        let url = self.metadata_url(&name)?;
        let mut request = self.http.get(url.as_str());
        if let Some(token) = self.npmrc.token_for(self.registry_for(&name)) {
            request = request.bearer_auth(token);
        }

        debug!(name = %name, url = %url, "Fetching metadata");
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PkgError::registry_unavailable(&name, status.as_u16()));
        }

        let body = response.bytes().await?;
        let metadata = PackageMetadata::from_slice(&body)?;
        self.cache.put(key, body, Some(self.ttl));

        Ok(Arc::new(metadata))
    }
}
