//! `package-lock.json` generation.
//!
//! The lockfile is derived purely from a [`ResolutionGraph`]: every map is a
//! `BTreeMap`, so the same graph always serializes to the same bytes no
//! matter what order packages were resolved in.
//!
//! ```json
//! {
//!   "name": "my-project",
//!   "version": "1.0.0",
//!   "lockfileVersion": 1,
//!   "packages": {
//!     "node_modules/pkg-a": {
//!       "version": "1.0.0",
//!       "resolved": "https://registry.example/pkg-a/-/pkg-a-1.0.0.tgz",
//!       "integrity": "sha512-...",
//!       "dependencies": { "pkg-b": "^2.0.0" }
//!     }
//!   },
//!   "dependencies": { "pkg-a": "1.0.0" }
//! }
//! ```

use super::error::PkgError;
use super::resolve::{ResolutionGraph, ResolvedPackage};
use crate::vfs::VirtualFs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;

/// Lockfile format version.
pub const LOCKFILE_VERSION: u32 = 1;

/// Lockfile filename.
pub const LOCKFILE_NAME: &str = "package-lock.json";

/// Prefix of every key in `packages`.
const PACKAGE_KEY_PREFIX: &str = "node_modules/";

/// Lockfile error codes.
pub mod codes {
    /// Lockfile not found at the expected path.
    pub const PKG_LOCK_NOT_FOUND: &str = "PKG_LOCK_NOT_FOUND";
    /// Lockfile has invalid JSON or an unexpected shape.
    pub const PKG_LOCK_INVALID_JSON: &str = "PKG_LOCK_INVALID_JSON";
    /// Lockfile version mismatch.
    pub const PKG_LOCK_VERSION_MISMATCH: &str = "PKG_LOCK_VERSION_MISMATCH";
    /// Lockfile write failed.
    pub const PKG_LOCK_WRITE_FAILED: &str = "PKG_LOCK_WRITE_FAILED";
}

/// Name and version recorded at the top of the lockfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRoot {
    pub name: String,
    pub version: String,
}

impl LockRoot {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for LockRoot {
    fn default() -> Self {
        Self::new("sandbox-project", "0.0.0")
    }
}

/// A locked package entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPackage {
    pub version: String,
    /// Tarball URL.
    pub resolved: String,
    /// Subresource integrity (or legacy shasum). Empty when the registry gave none.
    #[serde(default)]
    pub integrity: String,
    /// Declared dependencies (name -> range).
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// The complete lockfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lockfile {
    pub name: String,
    pub version: String,
    pub lockfile_version: u32,
    /// `"node_modules/{name}"` -> entry.
    pub packages: BTreeMap<String, LockPackage>,
    /// Name -> resolved version, one per package in the graph.
    pub dependencies: BTreeMap<String, String>,
}

/// Build the lockfile for a graph. Pure: no I/O, no clock.
#[must_use]
pub fn generate(graph: &ResolutionGraph, root: &LockRoot) -> Lockfile {
    let mut packages = BTreeMap::new();
    let mut dependencies = BTreeMap::new();

    for package in graph.packages() {
        packages.insert(
            Lockfile::package_key(&package.name),
            LockPackage {
                version: package.version.clone(),
                resolved: package.tarball_url.clone(),
                integrity: package.integrity.clone().unwrap_or_default(),
                dependencies: package.dependencies.clone(),
            },
        );
        dependencies.insert(package.name.clone(), package.version.clone());
    }

    Lockfile {
        name: root.name.clone(),
        version: root.version.clone(),
        lockfile_version: LOCKFILE_VERSION,
        packages,
        dependencies,
    }
}

/// Generate and write `{root_path}/package-lock.json`.
///
/// Returns the lockfile that was written.
pub fn write_lockfile(
    vfs: &dyn VirtualFs,
    root_path: &Path,
    graph: &ResolutionGraph,
    root: &LockRoot,
) -> Result<Lockfile, LockfileError> {
    let lockfile = generate(graph, root);
    lockfile.write_to(vfs, &root_path.join(LOCKFILE_NAME))?;
    Ok(lockfile)
}

impl Lockfile {
    /// Key of a package in `packages`.
    #[must_use]
    pub fn package_key(name: &str) -> String {
        format!("{PACKAGE_KEY_PREFIX}{name}")
    }

    /// Look up a package entry by name.
    #[must_use]
    pub fn get_package(&self, name: &str) -> Option<&LockPackage> {
        self.packages.get(&Self::package_key(name))
    }

    /// Serialize to pretty JSON with a trailing newline.
    pub fn to_json(&self) -> Result<String, LockfileError> {
        let mut json = serde_json::to_string_pretty(self).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_WRITE_FAILED,
                format!("Failed to serialize lockfile: {e}"),
            )
        })?;
        json.push('\n');
        Ok(json)
    }

    /// Parse and version-check a lockfile.
    pub fn from_json(json: &str) -> Result<Self, LockfileError> {
        let lockfile: Self = serde_json::from_str(json).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_INVALID_JSON,
                format!("Invalid lockfile JSON: {e}"),
            )
        })?;

        if lockfile.lockfile_version != LOCKFILE_VERSION {
            return Err(LockfileError::new(
                codes::PKG_LOCK_VERSION_MISMATCH,
                format!(
                    "Lockfile version {} not supported (expected {LOCKFILE_VERSION})",
                    lockfile.lockfile_version
                ),
            ));
        }
        Ok(lockfile)
    }

    /// Read a lockfile through the virtual filesystem.
    pub fn read_from(vfs: &dyn VirtualFs, path: &Path) -> Result<Self, LockfileError> {
        let bytes = vfs.read_file(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                LockfileError::new(
                    codes::PKG_LOCK_NOT_FOUND,
                    format!("Lockfile not found: {}", path.display()),
                )
            } else {
                LockfileError::new(
                    codes::PKG_LOCK_INVALID_JSON,
                    format!("Failed to read lockfile: {e}"),
                )
            }
        })?;
        Self::from_json(&String::from_utf8_lossy(&bytes))
    }

    /// Write the lockfile through the virtual filesystem.
    pub fn write_to(&self, vfs: &dyn VirtualFs, path: &Path) -> Result<(), LockfileError> {
        let json = self.to_json()?;
        vfs.write_file(path, json.as_bytes()).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_WRITE_FAILED,
                format!("Failed to write {}: {e}", path.display()),
            )
        })
    }

    /// Rebuild the resolution graph this lockfile records.
    ///
    /// `main`, `exports` and install scripts are not locked, so the rebuilt
    /// packages use the installer defaults.
    pub fn to_graph(&self, resolved_at: DateTime<Utc>) -> Result<ResolutionGraph, LockfileError> {
        let mut graph = ResolutionGraph::new();
        for (key, entry) in &self.packages {
            let name = key.strip_prefix(PACKAGE_KEY_PREFIX).ok_or_else(|| {
                LockfileError::new(
                    codes::PKG_LOCK_INVALID_JSON,
                    format!("Unexpected package key '{key}'"),
                )
            })?;
            graph.insert(ResolvedPackage {
                name: name.to_string(),
                version: entry.version.clone(),
                tarball_url: entry.resolved.clone(),
                integrity: (!entry.integrity.is_empty()).then(|| entry.integrity.clone()),
                dependencies: entry.dependencies.clone(),
                main: None,
                exports: None,
                install_scripts: BTreeMap::new(),
                resolved_at,
            });
        }
        Ok(graph)
    }
}

/// BLAKE3 digest of a lockfile's canonical JSON.
pub fn lockfile_content_hash(lockfile: &Lockfile) -> Result<String, LockfileError> {
    Ok(sandpm_util::hash::blake3_hex(lockfile.to_json()?.as_bytes()))
}

/// Lockfile error.
#[derive(Debug, Clone)]
pub struct LockfileError {
    code: &'static str,
    message: String,
}

impl LockfileError {
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for LockfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for LockfileError {}

impl From<LockfileError> for PkgError {
    fn from(e: LockfileError) -> Self {
        PkgError::new(e.code, e.message)
    }
}
