//! The `install` facade tying resolver, installer and lockfile together.

use super::cache::{CacheStats, MetadataCache};
use super::error::PkgError;
use super::install::VirtualInstaller;
use super::lockfile::{self, lockfile_content_hash, LockRoot, Lockfile, LOCKFILE_NAME};
use super::manifest::{read_manifest, MANIFEST_NAME};
use super::npmrc::load_npmrc;
use super::registry::RegistryClient;
use super::request::PackageRequest;
use super::resolve::{
    CancelFlag, CyclePolicy, DependencyResolver, ResolutionGraph, ResolveOptions, SkippedPackage,
};
use crate::config::PmConfig;
use crate::vfs::VirtualFs;
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Options for one [`PackageManager::install`] call.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Project directory. Defaults to [`PmConfig::default_cwd`].
    pub cwd: Option<PathBuf>,
    /// Explicit package specs (`name` or `name@hint`). When absent the
    /// manifest's dependencies are installed.
    pub packages: Option<Vec<String>>,
    /// Include `devDependencies` from the manifest.
    pub dev: bool,
    /// Install exactly what `package-lock.json` records without contacting
    /// the registry.
    pub frozen_lockfile: bool,
    pub cycle_policy: CyclePolicy,
    pub cancel: Option<CancelFlag>,
}

impl InstallOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = Some(packages.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn dev(mut self, dev: bool) -> Self {
        self.dev = dev;
        self
    }

    #[must_use]
    pub fn frozen_lockfile(mut self, frozen: bool) -> Self {
        self.frozen_lockfile = frozen;
        self
    }

    #[must_use]
    pub fn cycle_policy(mut self, policy: CyclePolicy) -> Self {
        self.cycle_policy = policy;
        self
    }

    #[must_use]
    pub fn cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }
}

/// Error reported in a failed [`InstallResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallError {
    pub code: String,
    pub message: String,
}

impl From<PkgError> for InstallError {
    fn from(e: PkgError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.message().to_string(),
        }
    }
}

/// Outcome of an install. Failures are reported here, never raised.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub success: bool,
    /// Installed package names, sorted.
    pub installed: Vec<String>,
    #[serde(rename = "durationMs", serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Dependencies left out by the partial-success policy.
    pub skipped: Vec<SkippedPackage>,
    /// BLAKE3 of the written lockfile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockfile_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<InstallError>,
}

impl InstallResult {
    fn failed(error: PkgError, duration: Duration) -> Self {
        Self {
            success: false,
            installed: Vec::new(),
            duration,
            skipped: Vec::new(),
            lockfile_hash: None,
            error: Some(error.into()),
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

struct Installed {
    graph: ResolutionGraph,
    skipped: Vec<SkippedPackage>,
    lockfile_hash: String,
}

/// Package manager bound to one filesystem and one set of caches.
///
/// Caches live as long as the manager; clones share them.
#[derive(Debug, Clone)]
pub struct PackageManager {
    fs: Arc<dyn VirtualFs>,
    config: PmConfig,
    cache: MetadataCache,
    registry: RegistryClient,
}

impl PackageManager {
    /// Create a manager with a fresh in-memory cache.
    ///
    /// # Errors
    /// Returns an error if the registry URL is invalid or the HTTP client
    /// cannot be built.
    pub fn new(fs: Arc<dyn VirtualFs>, config: PmConfig) -> Result<Self, PkgError> {
        Self::with_cache(fs, config, MetadataCache::default())
    }

    /// Create a manager over an existing cache.
    pub fn with_cache(
        fs: Arc<dyn VirtualFs>,
        config: PmConfig,
        cache: MetadataCache,
    ) -> Result<Self, PkgError> {
        let registry = RegistryClient::new(&config, cache.clone())?;
        Ok(Self {
            fs,
            config,
            cache,
            registry,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PmConfig {
        &self.config
    }

    /// Registry requests issued so far.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.registry.fetch_count()
    }

    /// Resolve, install and lock. Never fails; check `success`.
    pub async fn install(&self, options: InstallOptions) -> InstallResult {
        let started = Instant::now();
        let cwd = options
            .cwd
            .clone()
            .unwrap_or_else(|| self.config.default_cwd.clone());

        match self.run_install(&cwd, &options).await {
            Ok(done) => {
                let duration = started.elapsed();
                let fingerprint = done.lockfile_hash.get(..12).unwrap_or_default();
                info!(
                    cwd = %cwd.display(),
                    installed = done.graph.len(),
                    skipped = done.skipped.len(),
                    duration_ms = duration.as_millis() as u64,
                    lockfile = fingerprint,
                    "Install complete"
                );
                InstallResult {
                    success: true,
                    installed: done.graph.names().map(String::from).collect(),
                    duration,
                    skipped: done.skipped,
                    lockfile_hash: Some(done.lockfile_hash),
                    error: None,
                }
            }
            Err(e) => {
                warn!(cwd = %cwd.display(), code = e.code(), error = %e.message(), "Install failed");
                InstallResult::failed(e, started.elapsed())
            }
        }
    }

    /// Drop every cached metadata document and resolved package.
    pub fn clear_cache(&self) {
        self.cache.clear();
        debug!("Cache cleared");
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    async fn run_install(&self, cwd: &Path, options: &InstallOptions) -> Result<Installed, PkgError> {
        let (requests, root, mut skipped) = self.collect_requests(cwd, options)?;
        self.config.policy.check_requests(&requests)?;

        let lock_path = cwd.join(LOCKFILE_NAME);
        let graph = if options.frozen_lockfile {
            let locked = Lockfile::read_from(self.fs.as_ref(), &lock_path)?;
            debug!(packages = locked.packages.len(), "Installing from lockfile");
            locked.to_graph(self.cache.now())?
        } else {
            let registry = self.registry.with_npmrc(&load_npmrc(self.fs.as_ref(), cwd));
            let resolve_options = ResolveOptions {
                cycle_policy: options.cycle_policy,
                cancel: options.cancel.clone(),
            };
            let report = DependencyResolver::new(registry)
                .resolve(&requests, &resolve_options)
                .await?;
            debug!(
                fetched = report.fetched,
                cache_hits = report.cache_hits,
                "Resolved dependency graph"
            );
            skipped.extend(report.skipped);
            report.graph
        };

        self.config.policy.check_graph(&graph)?;
        if options.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            return Err(PkgError::cancelled());
        }

        VirtualInstaller::new(self.fs.as_ref()).install(cwd, &graph)?;

        let lock = if options.frozen_lockfile {
            lockfile::generate(&graph, &root)
        } else {
            lockfile::write_lockfile(self.fs.as_ref(), cwd, &graph, &root)?
        };
        let lockfile_hash = lockfile_content_hash(&lock)?;

        Ok(Installed {
            graph,
            skipped,
            lockfile_hash,
        })
    }

    /// Requests to install, the lockfile root, and manifest entries that
    /// had to be skipped.
    fn collect_requests(
        &self,
        cwd: &Path,
        options: &InstallOptions,
    ) -> Result<(Vec<PackageRequest>, LockRoot, Vec<SkippedPackage>), PkgError> {
        let manifest = match read_manifest(self.fs.as_ref(), cwd, options.dev) {
            Ok(manifest) => manifest,
            Err(e) if options.packages.is_some() => {
                warn!(code = e.code(), error = %e.message(), "Ignoring unreadable package.json");
                None
            }
            Err(e) => return Err(e),
        };

        let fallback = LockRoot::default();
        let root = LockRoot::new(
            manifest
                .as_ref()
                .and_then(|m| m.name.clone())
                .or_else(|| cwd.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or(fallback.name),
            manifest
                .as_ref()
                .and_then(|m| m.version.clone())
                .unwrap_or(fallback.version),
        );

        if let Some(packages) = &options.packages {
            let requests = packages
                .iter()
                .map(|spec| PackageRequest::parse(spec))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok((requests, root, Vec::new()));
        }

        let Some(manifest) = manifest else {
            return Err(PkgError::no_manifest(&cwd.join(MANIFEST_NAME)));
        };

        let skipped = manifest
            .errors
            .into_iter()
            .map(|issue| {
                warn!(name = %issue.name, error = %issue.message, "Skipping manifest entry");
                SkippedPackage {
                    name: issue.name,
                    code: issue.code.to_string(),
                    message: issue.message,
                }
            })
            .collect();
        Ok((manifest.requests, root, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::error::codes;
    use crate::pkg::lockfile::codes as lock_codes;
    use crate::pkg::policy::InstallPolicy;
    use crate::vfs::MemoryFs;

    /// Manager whose registry is unreachable.
    fn offline(fs: &Arc<MemoryFs>) -> PackageManager {
        let config = PmConfig::default()
            .with_registry("http://127.0.0.1:9/")
            .with_default_cwd("/app");
        PackageManager::new(fs.clone(), config).unwrap()
    }

    fn write(fs: &MemoryFs, path: &str, contents: &str) {
        let path = Path::new(path);
        fs.mkdir(path.parent().unwrap(), true).unwrap();
        fs.write_file(path, contents.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_no_manifest() {
        let fs = Arc::new(MemoryFs::new());
        let result = offline(&fs).install(InstallOptions::new()).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code, codes::PKG_NO_MANIFEST);
        assert!(error.message.contains("/app/package.json"));
    }

    #[tokio::test]
    async fn test_invalid_explicit_package() {
        let fs = Arc::new(MemoryFs::new());
        let result = offline(&fs)
            .install(InstallOptions::new().packages(["@broken"]))
            .await;
        assert_eq!(result.error.unwrap().code, codes::PKG_SPEC_INVALID);
    }

    #[tokio::test]
    async fn test_policy_blocks_before_resolving() {
        let fs = Arc::new(MemoryFs::new());
        write(&fs, "/app/package.json", r#"{"dependencies":{"sharp":"^0.33.0"}}"#);
        let pm = offline(&fs);

        let result = pm.install(InstallOptions::new()).await;
        assert_eq!(result.error.unwrap().code, codes::PKG_POLICY_BLOCKED);
        assert_eq!(pm.fetch_count(), 0);
        assert!(!fs.exists(Path::new("/app/node_modules")));
    }

    #[tokio::test]
    async fn test_empty_manifest_writes_empty_lockfile() {
        let fs = Arc::new(MemoryFs::new());
        write(&fs, "/app/package.json", r#"{"name":"demo","version":"2.0.0"}"#);

        let result = offline(&fs).install(InstallOptions::new()).await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.installed.is_empty());

        let lock = Lockfile::read_from(fs.as_ref(), Path::new("/app/package-lock.json")).unwrap();
        assert_eq!(lock.name, "demo");
        assert_eq!(lock.version, "2.0.0");
        assert!(lock.packages.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_manifest_entries_reported() {
        let fs = Arc::new(MemoryFs::new());
        write(&fs, "/app/package.json", r#"{"dependencies":{"weird":42}}"#);

        let result = offline(&fs).install(InstallOptions::new()).await;
        assert!(result.success);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].name, "weird");
    }

    #[tokio::test]
    async fn test_frozen_lockfile_missing() {
        let fs = Arc::new(MemoryFs::new());
        write(&fs, "/app/package.json", r#"{"dependencies":{"a":"*"}}"#);

        let result = offline(&fs)
            .install(InstallOptions::new().frozen_lockfile(true))
            .await;
        assert_eq!(result.error.unwrap().code, lock_codes::PKG_LOCK_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_frozen_lockfile_installs_offline() {
        let fs = Arc::new(MemoryFs::new());
        write(&fs, "/app/package.json", r#"{"name":"app","version":"1.0.0","dependencies":{"a":"*"}}"#);
        write(
            &fs,
            "/app/package-lock.json",
            r#"{
              "name": "app",
              "version": "1.0.0",
              "lockfileVersion": 1,
              "packages": {
                "node_modules/a": { "version": "1.2.3", "resolved": "http://r/a.tgz", "integrity": "", "dependencies": { "b": "^1.0.0" } },
                "node_modules/b": { "version": "1.0.4", "resolved": "http://r/b.tgz", "integrity": "" }
              },
              "dependencies": { "a": "1.2.3", "b": "1.0.4" }
            }"#,
        );
        let pm = offline(&fs);

        let result = pm
            .install(InstallOptions::new().frozen_lockfile(true))
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.installed, vec!["a", "b"]);
        assert_eq!(pm.fetch_count(), 0);

        let manifest = fs
            .read_file(Path::new("/app/node_modules/a/package.json"))
            .unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(&manifest).unwrap();
        assert_eq!(manifest["dependencies"]["b"], "1.0.4");
    }

    #[tokio::test]
    async fn test_explicit_packages_without_manifest_use_cwd_name() {
        let fs = Arc::new(MemoryFs::new());
        fs.mkdir(Path::new("/work/site"), true).unwrap();
        let config = PmConfig::default()
            .with_registry("http://127.0.0.1:9/")
            .with_policy(InstallPolicy::permissive());
        let pm = PackageManager::new(fs.clone(), config).unwrap();

        let result = pm
            .install(InstallOptions::new().cwd("/work/site").packages(Vec::<String>::new()))
            .await;
        assert!(result.success, "{:?}", result.error);

        let lock =
            Lockfile::read_from(fs.as_ref(), Path::new("/work/site/package-lock.json")).unwrap();
        assert_eq!(lock.name, "site");
        assert_eq!(lock.version, "0.0.0");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fs = Arc::new(MemoryFs::new());
        write(&fs, "/app/package.json", r#"{"dependencies":{"a":"*"}}"#);
        let flag = CancelFlag::new();
        flag.cancel();

        let result = offline(&fs).install(InstallOptions::new().cancel(flag)).await;
        assert_eq!(result.error.unwrap().code, codes::PKG_INSTALL_CANCELLED);
        assert!(!fs.exists(Path::new("/app/node_modules")));
    }

    #[test]
    fn test_result_serialization() {
        let result = InstallResult::failed(
            PkgError::no_manifest(Path::new("/app/package.json")),
            Duration::from_millis(42),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["durationMs"], 42);
        assert_eq!(json["error"]["code"], "PKG_NO_MANIFEST");
        assert!(json.get("lockfileHash").is_none());
    }
}
