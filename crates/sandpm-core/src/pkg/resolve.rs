//! Dependency resolution.
//!
//! Computes the transitive closure of the requested names into a flat graph:
//! one version per package name, first resolution wins. Versions always come
//! from the `latest` dist-tag.

use super::error::PkgError;
use super::metadata::VersionRecord;
use super::registry::RegistryClient;
use super::request::{validate_name, PackageRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle scripts that run at install time.
const INSTALL_HOOKS: [&str; 3] = ["preinstall", "install", "postinstall"];

/// A package pinned to one concrete version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: String,
    pub tarball_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    /// Declared dependencies (name -> range).
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exports: Option<Value>,
    /// Install hooks declared by the package (`preinstall`, `install`, `postinstall`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub install_scripts: BTreeMap<String, String>,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedPackage {
    /// Build from the selected registry version.
    #[must_use]
    pub fn from_record(name: &str, record: &VersionRecord, resolved_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            version: record.version.clone(),
            tarball_url: record.dist.tarball.clone(),
            integrity: record.dist.integrity_or_shasum().map(String::from),
            dependencies: record.dependencies.clone(),
            main: record.main.clone(),
            exports: record.exports.clone(),
            install_scripts: record
                .scripts
                .iter()
                .filter(|(hook, _)| INSTALL_HOOKS.contains(&hook.as_str()))
                .map(|(hook, cmd)| (hook.clone(), cmd.clone()))
                .collect(),
            resolved_at,
        }
    }
}

/// Name -> resolved package. Keyed by name, so the flat-install invariant
/// holds by construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolutionGraph {
    packages: BTreeMap<String, ResolvedPackage>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl ResolutionGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a package unless its name is already resolved.
    ///
    /// Returns `false` (and keeps the existing entry) on a repeat name.
    pub fn insert(&mut self, package: ResolvedPackage) -> bool {
        match self.packages.entry(package.name.clone()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(package);
                true
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResolvedPackage> {
        self.packages.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Package names in lexicographic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    /// Packages in name order.
    pub fn packages(&self) -> impl Iterator<Item = &ResolvedPackage> {
        self.packages.values()
    }

    /// Canonical JSON form. Equal graphs serialize to identical bytes.
    ///
    /// # Errors
    /// Only if a package's `exports` value cannot be serialized.
    pub fn to_json(&self) -> Result<String, PkgError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PkgError::cache_error(format!("Failed to serialize graph: {e}")))
    }

    /// Find a dependency cycle among resolved packages.
    ///
    /// Returns the path with the first name repeated at the end, e.g.
    /// `["a", "b", "a"]`. Edges to unresolved names are ignored.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();
        self.packages
            .keys()
            .find_map(|name| self.visit(name, &mut marks, &mut stack))
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == name)?;
                let mut cycle: Vec<String> = stack[start..].iter().map(|n| (*n).to_string()).collect();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(name, Mark::Visiting);
        stack.push(name);
        if let Some(package) = self.packages.get(name) {
            for dep in package.dependencies.keys() {
                if !self.packages.contains_key(dep) {
                    continue;
                }
                if let Some(cycle) = self.visit(dep, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        None
    }
}

/// What to do when the graph contains a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePolicy {
    /// Resolve each name once and carry on. Cycles install fine in a flat tree.
    #[default]
    Flatten,
    /// Fail with `PKG_CIRCULAR_DEPENDENCY`.
    Reject,
}

/// Cooperative cancellation shared between a caller and a running install.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the install to stop before its next package.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for dependency resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub cycle_policy: CyclePolicy,
    pub cancel: Option<CancelFlag>,
}

/// A name that could not be resolved and was left out of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPackage {
    pub name: String,
    pub code: String,
    pub message: String,
}

/// Result of a resolve.
#[derive(Debug, Clone)]
pub struct ResolveReport {
    pub graph: ResolutionGraph,
    /// Names dropped by the partial-success policy, in the order they failed.
    pub skipped: Vec<SkippedPackage>,
    /// Packages resolved from registry metadata during this call.
    pub fetched: usize,
    /// Packages taken from the resolved-package cache.
    pub cache_hits: usize,
}

/// Breadth-first resolver over a [`RegistryClient`].
///
/// Resolved packages are kept in the registry's cache under
/// `resolved:{name}` without expiry, so repeated resolves of the same names
/// never touch the network.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    registry: RegistryClient,
}

impl DependencyResolver {
    #[must_use]
    pub fn new(registry: RegistryClient) -> Self {
        Self { registry }
    }

    /// Resolve the transitive closure of `requests`.
    ///
    /// Names are processed one at a time in queue order. A name that fails
    /// (registry error, missing version, invalid name) is logged and skipped;
    /// the rest of the queue still resolves.
    ///
    /// # Errors
    /// `PKG_INSTALL_CANCELLED` when the cancel flag is raised, and
    /// `PKG_CIRCULAR_DEPENDENCY` under [`CyclePolicy::Reject`].
    pub async fn resolve(
        &self,
        requests: &[PackageRequest],
        options: &ResolveOptions,
    ) -> Result<ResolveReport, PkgError> {
        let mut graph = ResolutionGraph::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = requests.iter().map(|r| r.name.clone()).collect();
        let mut skipped = Vec::new();
        let mut fetched = 0;
        let mut cache_hits = 0;

        while let Some(name) = queue.pop_front() {
            if options.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                debug!(resolved = graph.len(), pending = queue.len() + 1, "Resolve cancelled");
                return Err(PkgError::cancelled());
            }

            if !visited.insert(name.clone()) {
                continue;
            }

            let package = if let Some(cached) = self.cached_package(&name) {
                cache_hits += 1;
                cached
            } else {
                match self.resolve_one(&name).await {
                    Ok(package) => {
                        fetched += 1;
                        self.remember(&package);
                        package
                    }
                    Err(e) => {
                        warn!(name = %name, code = e.code(), error = %e.message(), "Skipping package");
                        skipped.push(SkippedPackage {
                            name,
                            code: e.code().to_string(),
                            message: e.message().to_string(),
                        });
                        continue;
                    }
                }
            };

            for dep in package.dependencies.keys() {
                if !visited.contains(dep) {
                    queue.push_back(dep.clone());
                }
            }
            debug!(name = %package.name, version = %package.version, "Resolved");
            graph.insert(package);
        }

        if options.cycle_policy == CyclePolicy::Reject {
            if let Some(cycle) = graph.find_cycle() {
                return Err(PkgError::circular_dependency(&cycle));
            }
        }

        Ok(ResolveReport {
            graph,
            skipped,
            fetched,
            cache_hits,
        })
    }

    async fn resolve_one(&self, name: &str) -> Result<ResolvedPackage, PkgError> {
        validate_name(name)?;
        let metadata = self.registry.fetch_metadata(name).await?;
        let record = metadata.select_latest(name)?;
        Ok(ResolvedPackage::from_record(
            name,
            record,
            self.registry.cache().now(),
        ))
    }

    fn cached_package(&self, name: &str) -> Option<ResolvedPackage> {
        let key = self.registry.resolved_cache_key(name);
        let bytes = self.registry.cache().get_fresh(&key)?;
        match serde_json::from_slice(&bytes) {
            Ok(package) => Some(package),
            Err(e) => {
                warn!(name, error = %e, "Discarding unreadable resolved-package cache entry");
                self.registry.cache().invalidate(&key);
                None
            }
        }
    }

    fn remember(&self, package: &ResolvedPackage) {
        match serde_json::to_vec(package) {
            Ok(bytes) => self
                .registry
                .cache()
                .put(self.registry.resolved_cache_key(&package.name), bytes, None),
            Err(e) => warn!(name = %package.name, error = %e, "Not caching resolved package"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PmConfig;
    use crate::pkg::cache::{metadata_key, ManualClock, MemoryCacheStore, MetadataCache};
    use crate::pkg::error::codes;
    use std::time::Duration;

    /// Resolver whose registry is unreachable; every package it should find
    /// must be seeded into the metadata cache.
    fn offline_resolver() -> DependencyResolver {
        let cache = MetadataCache::new(
            Arc::new(MemoryCacheStore::new()),
            Arc::new(ManualClock::default()),
        );
        let registry = RegistryClient::new(
            &PmConfig::default().with_registry("http://127.0.0.1:9/"),
            cache,
        )
        .unwrap();
        DependencyResolver::new(registry)
    }

    fn seed(resolver: &DependencyResolver, name: &str, version: &str, deps: &[&str]) {
        let deps: serde_json::Map<String, Value> = deps
            .iter()
            .map(|d| ((*d).to_string(), Value::String("*".to_string())))
            .collect();
        let doc = serde_json::json!({
            "name": name,
            "dist-tags": { "latest": version },
            "versions": {
                version: {
                    "dependencies": deps,
                    "dist": { "tarball": format!("http://127.0.0.1:9/{name}/-/{name}-{version}.tgz") }
                }
            }
        });
        resolver.registry.cache().put(
            metadata_key(name),
            serde_json::to_vec(&doc).unwrap(),
            Some(Duration::from_secs(300)),
        );
    }

    fn requests(names: &[&str]) -> Vec<PackageRequest> {
        names.iter().map(|n| PackageRequest::new(*n)).collect()
    }

    #[tokio::test]
    async fn test_resolves_chain() {
        let resolver = offline_resolver();
        seed(&resolver, "pkg-a", "1.0.0", &["pkg-b"]);
        seed(&resolver, "pkg-b", "2.0.0", &["pkg-c"]);
        seed(&resolver, "pkg-c", "3.0.0", &[]);

        let report = resolver
            .resolve(&requests(&["pkg-a"]), &ResolveOptions::default())
            .await
            .unwrap();

        let names: Vec<&str> = report.graph.names().collect();
        assert_eq!(names, vec!["pkg-a", "pkg-b", "pkg-c"]);
        assert_eq!(report.graph.get("pkg-b").unwrap().version, "2.0.0");
        assert_eq!(report.fetched, 3);
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_flattens() {
        let resolver = offline_resolver();
        seed(&resolver, "pkg-a", "1.0.0", &["pkg-b"]);
        seed(&resolver, "pkg-b", "1.0.0", &["pkg-a"]);

        let report = resolver
            .resolve(&requests(&["pkg-a", "pkg-b"]), &ResolveOptions::default())
            .await
            .unwrap();

        assert_eq!(report.graph.len(), 2);
        assert_eq!(
            report.graph.find_cycle().unwrap(),
            vec!["pkg-a", "pkg-b", "pkg-a"]
        );
    }

    #[tokio::test]
    async fn test_cycle_rejected_when_asked() {
        let resolver = offline_resolver();
        seed(&resolver, "pkg-a", "1.0.0", &["pkg-b"]);
        seed(&resolver, "pkg-b", "1.0.0", &["pkg-a"]);

        let options = ResolveOptions {
            cycle_policy: CyclePolicy::Reject,
            ..ResolveOptions::default()
        };
        let err = resolver
            .resolve(&requests(&["pkg-a"]), &options)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::PKG_CIRCULAR_DEPENDENCY);
        assert!(err.message().contains("pkg-a -> pkg-b -> pkg-a"));
    }

    #[tokio::test]
    async fn test_broken_dependency_is_skipped() {
        let resolver = offline_resolver();
        seed(&resolver, "pkg-a", "1.0.0", &["broken", "pkg-c", "../evil"]);
        seed(&resolver, "pkg-c", "1.0.0", &[]);
        // `latest` points at a version that was never published.
        resolver.registry.cache().put(
            metadata_key("broken"),
            &br#"{"dist-tags":{"latest":"9.9.9"},"versions":{}}"#[..],
            None,
        );

        let report = resolver
            .resolve(&requests(&["pkg-a"]), &ResolveOptions::default())
            .await
            .unwrap();

        let names: Vec<&str> = report.graph.names().collect();
        assert_eq!(names, vec!["pkg-a", "pkg-c"]);
        let skipped: Vec<(&str, &str)> = report
            .skipped
            .iter()
            .map(|s| (s.name.as_str(), s.code.as_str()))
            .collect();
        assert!(skipped.contains(&("broken", codes::PKG_VERSION_NOT_FOUND)));
        assert!(skipped.contains(&("../evil", codes::PKG_SPEC_INVALID)));
    }

    #[tokio::test]
    async fn test_second_resolve_uses_package_cache() {
        let resolver = offline_resolver();
        seed(&resolver, "pkg-a", "1.0.0", &["pkg-b"]);
        seed(&resolver, "pkg-b", "1.0.0", &[]);

        let first = resolver
            .resolve(&requests(&["pkg-a"]), &ResolveOptions::default())
            .await
            .unwrap();
        // Metadata gone: only the resolved-package cache can answer now.
        resolver.registry.cache().invalidate(&metadata_key("pkg-a"));
        resolver.registry.cache().invalidate(&metadata_key("pkg-b"));
        let second = resolver
            .resolve(&requests(&["pkg-a"]), &ResolveOptions::default())
            .await
            .unwrap();

        assert_eq!(second.cache_hits, 2);
        assert_eq!(second.fetched, 0);
        assert_eq!(first.graph.to_json().unwrap(), second.graph.to_json().unwrap());
    }

    #[tokio::test]
    async fn test_first_resolved_wins() {
        let resolver = offline_resolver();
        seed(&resolver, "pkg-a", "1.0.0", &[]);

        let report = resolver
            .resolve(
                &[
                    PackageRequest::with_hint("pkg-a", "^0.1.0"),
                    PackageRequest::with_hint("pkg-a", "2.x"),
                ],
                &ResolveOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.graph.len(), 1);
        assert_eq!(report.graph.get("pkg-a").unwrap().version, "1.0.0");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let resolver = offline_resolver();
        seed(&resolver, "pkg-a", "1.0.0", &[]);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let options = ResolveOptions {
            cancel: Some(cancel),
            ..ResolveOptions::default()
        };
        let err = resolver
            .resolve(&requests(&["pkg-a"]), &options)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::PKG_INSTALL_CANCELLED);
    }

    #[test]
    fn test_graph_insert_keeps_first() {
        let mut graph = ResolutionGraph::new();
        let record: VersionRecord =
            serde_json::from_str(r#"{"version":"1.0.0","dist":{"tarball":"t"}}"#).unwrap();
        let now = DateTime::<Utc>::UNIX_EPOCH;
        assert!(graph.insert(ResolvedPackage::from_record("x", &record, now)));

        let mut newer = ResolvedPackage::from_record("x", &record, now);
        newer.version = "2.0.0".to_string();
        assert!(!graph.insert(newer));
        assert_eq!(graph.get("x").unwrap().version, "1.0.0");
    }

    #[test]
    fn test_install_scripts_filtered() {
        let record: VersionRecord = serde_json::from_str(
            r#"{"version":"1.0.0","scripts":{"test":"jest","postinstall":"node build.js"}}"#,
        )
        .unwrap();
        let package = ResolvedPackage::from_record("x", &record, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(package.install_scripts.len(), 1);
        assert_eq!(package.install_scripts["postinstall"], "node build.js");
    }

    #[test]
    fn test_find_cycle_none_for_dag() {
        let mut graph = ResolutionGraph::new();
        for (name, deps) in [("a", vec!["b", "c"]), ("b", vec!["c"]), ("c", vec![])] {
            let mut package = ResolvedPackage::from_record(
                name,
                &serde_json::from_str(r#"{"version":"1.0.0"}"#).unwrap(),
                DateTime::<Utc>::UNIX_EPOCH,
            );
            package.dependencies = deps
                .into_iter()
                .map(|d| (d.to_string(), "*".to_string()))
                .collect();
            graph.insert(package);
        }
        assert!(graph.find_cycle().is_none());
    }
}
