//! Package requests.
//!
//! A request names a package and, optionally, the version the caller asked
//! for. Requests come from a manifest's dependency map or from strings like:
//! - `react`
//! - `react@^18.0.0`
//! - `@types/node`
//! - `@types/node@20`

use super::error::PkgError;
use std::fmt;

/// A package the caller wants installed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageRequest {
    /// Full package name (e.g., `@scope/name` or `name`).
    pub name: String,
    /// Requested range or tag. Accepted but resolution always picks `latest`.
    pub version_hint: Option<String>,
}

impl PackageRequest {
    /// A request for `name` at the latest version.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_hint: None,
        }
    }

    /// A request carrying a version hint.
    #[must_use]
    pub fn with_hint(name: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_hint: Some(hint.into()),
        }
    }

    /// Parse `name[@hint]`.
    ///
    /// # Errors
    /// Returns `PKG_SPEC_INVALID` for empty names, empty hints, malformed
    /// scopes or characters npm does not allow in names.
    pub fn parse(input: &str) -> Result<Self, PkgError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(PkgError::spec_invalid("Empty package spec"));
        }

        // The version delimiter is the first '@' that is not the scope marker.
        let search_from = usize::from(input.starts_with('@'));
        let (name, hint) = match input[search_from..].find('@') {
            Some(pos) => {
                let at = pos + search_from;
                let hint = &input[at + 1..];
                if hint.is_empty() {
                    return Err(PkgError::spec_invalid(format!(
                        "Empty version hint in '{input}'"
                    )));
                }
                (&input[..at], Some(hint.to_string()))
            }
            None => (input, None),
        };

        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            version_hint: hint,
        })
    }

    /// Scope without the `@`, if scoped.
    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.name
            .strip_prefix('@')
            .and_then(|rest| rest.split_once('/'))
            .map(|(scope, _)| scope)
    }
}

impl fmt::Display for PackageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version_hint {
            Some(hint) => write!(f, "{}@{hint}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Validate a package name, scoped or not.
pub fn validate_name(name: &str) -> Result<(), PkgError> {
    let bare = if let Some(rest) = name.strip_prefix('@') {
        let Some((scope, bare)) = rest.split_once('/') else {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: missing '/' in '{name}'"
            )));
        };
        if scope.is_empty() || bare.is_empty() {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: empty scope or name in '{name}'"
            )));
        }
        check_chars(name, scope)?;
        bare
    } else {
        name
    };

    if bare.is_empty() {
        return Err(PkgError::spec_invalid("Empty package name"));
    }
    if bare.starts_with('.') || bare.starts_with('_') {
        return Err(PkgError::spec_invalid(format!(
            "Package name '{name}' cannot start with '.' or '_'"
        )));
    }
    check_chars(name, bare)
}

fn check_chars(full: &str, part: &str) -> Result<(), PkgError> {
    match part
        .chars()
        .find(|&c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~')))
    {
        Some(c) => Err(PkgError::spec_invalid(format!(
            "Invalid character '{c}' in package name '{full}'"
        ))),
        None => Ok(()),
    }
}
