//! Install policy gate.
//!
//! Sits in front of the resolver and the installer: requested names are
//! checked before anything is fetched, and the resolved graph is checked
//! before anything is written. The resolver itself knows nothing about it.

use super::error::PkgError;
use super::request::PackageRequest;
use super::resolve::ResolutionGraph;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Packages that need a native toolchain or prebuilt binaries to work.
const NATIVE_BUILD_PACKAGES: &[&str] = &[
    "bcrypt",
    "better-sqlite3",
    "canvas",
    "cpu-features",
    "fsevents",
    "node-gyp",
    "node-pre-gyp",
    "node-sass",
    "puppeteer",
    "sharp",
    "sqlite3",
    "@mapbox/node-pre-gyp",
];

/// Which packages and scripts may be installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPolicy {
    /// Names that may not appear anywhere in the install.
    pub denied_packages: BTreeSet<String>,
    /// Reject packages whose install hooks classify as dangerous.
    pub block_install_scripts: bool,
}

/// Verdict on a lifecycle script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptRisk {
    Safe,
    Dangerous { reason: &'static str },
}

fn script_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                r"\b(curl|wget)\b[^|;&]*\|\s*(ba|z|da)?sh\b",
                "pipes a download into a shell",
            ),
            (r"\brm\s+-[a-zA-Z]*(rf|fr)", "recursive forced delete"),
            (r"\bsudo\b", "privilege escalation"),
            (
                r"\b(node-gyp|node-pre-gyp|prebuild-install|cmake-js)\b",
                "builds a native addon",
            ),
            (r"\beval\b", "evaluates dynamic code"),
            (r"\b(curl|wget|nc|ncat)\b", "network access"),
            (r"\bchmod\s+[+0-7]*[sx]*\s*/", "changes permissions outside the package"),
        ]
        .into_iter()
        .filter_map(|(pattern, reason)| Regex::new(pattern).ok().map(|re| (re, reason)))
        .collect()
    })
}

/// Classify a lifecycle script command line.
#[must_use]
pub fn classify_script(command: &str) -> ScriptRisk {
    script_rules()
        .iter()
        .find(|(re, _)| re.is_match(command))
        .map_or(ScriptRisk::Safe, |(_, reason)| ScriptRisk::Dangerous { reason })
}

impl InstallPolicy {
    /// Allow everything.
    #[must_use]
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Deny native-build packages and dangerous install scripts.
    #[must_use]
    pub fn sandboxed() -> Self {
        Self {
            denied_packages: NATIVE_BUILD_PACKAGES.iter().map(|s| (*s).to_string()).collect(),
            block_install_scripts: true,
        }
    }

    /// Add a name to the deny list.
    #[must_use]
    pub fn deny(mut self, name: impl Into<String>) -> Self {
        self.denied_packages.insert(name.into());
        self
    }

    #[must_use]
    pub fn is_denied(&self, name: &str) -> bool {
        self.denied_packages.contains(name)
    }

    /// Reject requests that name a denied package.
    pub fn check_requests(&self, requests: &[PackageRequest]) -> Result<(), PkgError> {
        let denied: Vec<&str> = requests
            .iter()
            .map(|r| r.name.as_str())
            .filter(|name| self.is_denied(name))
            .collect();
        if denied.is_empty() {
            Ok(())
        } else {
            Err(PkgError::policy_blocked(format!(
                "Package(s) not allowed in this sandbox: {}",
                denied.join(", ")
            )))
        }
    }

    /// Reject a graph containing denied packages or dangerous install hooks.
    pub fn check_graph(&self, graph: &ResolutionGraph) -> Result<(), PkgError> {
        for package in graph.packages() {
            if self.is_denied(&package.name) {
                return Err(PkgError::policy_blocked(format!(
                    "Package '{}' is not allowed in this sandbox",
                    package.name
                )));
            }
            if !self.block_install_scripts {
                continue;
            }
            for (hook, command) in &package.install_scripts {
                if let ScriptRisk::Dangerous { reason } = classify_script(command) {
                    return Err(PkgError::policy_blocked(format!(
                        "{}@{} {hook} script blocked ({reason}): {command}",
                        package.name, package.version
                    )));
                }
            }
        }
        Ok(())
    }
}
