//! Package manager functionality.
//!
//! Provides:
//! - TTL-keyed metadata cache with hit statistics
//! - Registry client with `.npmrc` support and request coalescing
//! - Breadth-first flat dependency resolution (always `latest`)
//! - Virtual `node_modules` synthesis through a [`crate::VirtualFs`]
//! - Deterministic `package-lock.json` generation
//! - An install policy gate for native builds and install scripts

pub mod cache;
pub mod error;
pub mod install;
pub mod lockfile;
pub mod manager;
pub mod manifest;
pub mod metadata;
pub mod npmrc;
pub mod policy;
pub mod registry;
pub mod request;
pub mod resolve;

pub use cache::{
    CacheEntry, CacheStats, CacheStore, Clock, ManualClock, MemoryCacheStore, MetadataCache,
    SystemClock,
};
pub use error::{codes as pkg_codes, PkgError};
pub use install::VirtualInstaller;
pub use lockfile::{
    codes as lockfile_codes, generate as generate_lockfile, lockfile_content_hash, LockPackage,
    LockRoot, Lockfile, LockfileError, LOCKFILE_NAME,
};
pub use manager::{InstallError, InstallOptions, InstallResult, PackageManager};
pub use manifest::{read_manifest, ManifestDeps};
pub use metadata::{PackageMetadata, VersionRecord};
pub use npmrc::{load_npmrc, NpmrcConfig};
pub use policy::{classify_script, InstallPolicy, ScriptRisk};
pub use registry::RegistryClient;
pub use request::PackageRequest;
pub use resolve::{
    CancelFlag, CyclePolicy, DependencyResolver, ResolutionGraph, ResolveOptions, ResolveReport,
    ResolvedPackage, SkippedPackage,
};
