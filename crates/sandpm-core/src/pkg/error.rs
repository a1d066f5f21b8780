//! Package manager error types.

use std::fmt;
use std::path::Path;

/// Package manager error codes.
pub mod codes {
    pub const PKG_SPEC_INVALID: &str = "PKG_SPEC_INVALID";
    pub const PKG_NO_MANIFEST: &str = "PKG_NO_MANIFEST";
    pub const PKG_PACKAGE_JSON_INVALID: &str = "PKG_PACKAGE_JSON_INVALID";
    pub const PKG_REGISTRY_UNAVAILABLE: &str = "PKG_REGISTRY_UNAVAILABLE";
    pub const PKG_REGISTRY_ERROR: &str = "PKG_REGISTRY_ERROR";
    pub const PKG_VERSION_NOT_FOUND: &str = "PKG_VERSION_NOT_FOUND";
    pub const NODE_MODULES_WRITE_FAILED: &str = "NODE_MODULES_WRITE_FAILED";
    pub const PKG_CIRCULAR_DEPENDENCY: &str = "PKG_CIRCULAR_DEPENDENCY";
    pub const PKG_POLICY_BLOCKED: &str = "PKG_POLICY_BLOCKED";
    pub const PKG_INSTALL_CANCELLED: &str = "PKG_INSTALL_CANCELLED";
    pub const PKG_CACHE_ERROR: &str = "PKG_CACHE_ERROR";
}

/// Package manager error.
///
/// Cheap to clone so one failed registry fetch can be handed to every caller
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkgError {
    code: &'static str,
    message: String,
}

impl PkgError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this error aborts a whole install.
    ///
    /// Registry and version failures only cost the package they concern.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.code,
            codes::PKG_REGISTRY_UNAVAILABLE | codes::PKG_REGISTRY_ERROR | codes::PKG_VERSION_NOT_FOUND
        )
    }

    /// Create a spec invalid error.
    pub fn spec_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_SPEC_INVALID, msg)
    }

    /// No manifest and no explicit package list.
    #[must_use]
    pub fn no_manifest(path: &Path) -> Self {
        Self::new(
            codes::PKG_NO_MANIFEST,
            format!(
                "No package.json at {} and no packages were given",
                path.display()
            ),
        )
    }

    /// Create a package.json invalid error.
    pub fn package_json_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_PACKAGE_JSON_INVALID, msg)
    }

    /// The registry answered with a non-success status.
    #[must_use]
    pub fn registry_unavailable(name: &str, status: u16) -> Self {
        Self::new(
            codes::PKG_REGISTRY_UNAVAILABLE,
            format!("Registry returned status {status} for '{name}'"),
        )
    }

    /// Create a registry transport or protocol error.
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_REGISTRY_ERROR, msg)
    }

    /// Create a version not found error.
    #[must_use]
    pub fn version_not_found(name: &str, wanted: &str) -> Self {
        Self::new(
            codes::PKG_VERSION_NOT_FOUND,
            format!("No version of {name} matches: {wanted}"),
        )
    }

    /// Create a `node_modules` write failed error.
    pub fn node_modules_write_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::NODE_MODULES_WRITE_FAILED, msg)
    }

    /// Create a circular dependency error from the cycle path.
    #[must_use]
    pub fn circular_dependency(cycle: &[String]) -> Self {
        Self::new(
            codes::PKG_CIRCULAR_DEPENDENCY,
            format!("Circular dependency: {}", cycle.join(" -> ")),
        )
    }

    /// Create a policy blocked error.
    pub fn policy_blocked(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_POLICY_BLOCKED, msg)
    }

    /// Create a cancellation error.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(codes::PKG_INSTALL_CANCELLED, "Install was cancelled")
    }

    /// Create a cache error.
    pub fn cache_error(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_CACHE_ERROR, msg)
    }
}

impl fmt::Display for PkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PkgError {}

impl From<reqwest::Error> for PkgError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::registry(format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::registry(format!("Connection failed: {e}"))
        } else {
            Self::registry(e.to_string())
        }
    }
}

impl From<serde_json::Error> for PkgError {
    fn from(e: serde_json::Error) -> Self {
        Self::registry(format!("Invalid JSON: {e}"))
    }
}
