//! Reading the root `package.json`.

use super::error::{codes, PkgError};
use super::request::PackageRequest;
use crate::vfs::VirtualFs;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Manifest filename.
pub const MANIFEST_NAME: &str = "package.json";

/// Dependencies extracted from a root manifest.
#[derive(Debug, Clone, Default)]
pub struct ManifestDeps {
    /// `name` field, if present.
    pub name: Option<String>,
    /// `version` field, if present.
    pub version: Option<String>,
    /// Requested packages, sorted by name.
    pub requests: Vec<PackageRequest>,
    /// Entries that were skipped because they were malformed.
    pub errors: Vec<DepIssue>,
}

/// A manifest entry that could not be turned into a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepIssue {
    /// Dependency or section name.
    pub name: String,
    pub code: &'static str,
    pub message: String,
}

/// Read `{cwd}/package.json` and extract its dependency names.
///
/// `devDependencies` are included when `include_dev` is set; an entry in
/// `dependencies` wins over the same name in `devDependencies`.
///
/// Returns `Ok(None)` when the manifest does not exist.
///
/// # Errors
/// `PKG_PACKAGE_JSON_INVALID` when the file cannot be read or is not a JSON
/// object.
pub fn read_manifest(
    vfs: &dyn VirtualFs,
    cwd: &Path,
    include_dev: bool,
) -> Result<Option<ManifestDeps>, PkgError> {
    let path = cwd.join(MANIFEST_NAME);
    if !vfs.exists(&path) {
        return Ok(None);
    }

    let bytes = vfs.read_file(&path).map_err(|e| {
        PkgError::package_json_invalid(format!("Failed to read {}: {e}", path.display()))
    })?;
    parse_manifest(&bytes, include_dev).map(Some)
}

/// Parse manifest bytes. See [`read_manifest`].
pub fn parse_manifest(bytes: &[u8], include_dev: bool) -> Result<ManifestDeps, PkgError> {
    let json: Value = serde_json::from_slice(bytes)
        .map_err(|e| PkgError::package_json_invalid(format!("Invalid JSON: {e}")))?;
    let root = json
        .as_object()
        .ok_or_else(|| PkgError::package_json_invalid("package.json must be a JSON object"))?;

    let mut manifest = ManifestDeps {
        name: root.get("name").and_then(Value::as_str).map(String::from),
        version: root.get("version").and_then(Value::as_str).map(String::from),
        ..ManifestDeps::default()
    };

    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    if include_dev {
        collect_section(root, "devDependencies", &mut merged, &mut manifest.errors);
    }
    collect_section(root, "dependencies", &mut merged, &mut manifest.errors);

    manifest.requests = merged
        .into_iter()
        .map(|(name, hint)| PackageRequest::with_hint(name, hint))
        .collect();
    Ok(manifest)
}

fn collect_section(
    root: &Map<String, Value>,
    section: &str,
    into: &mut BTreeMap<String, String>,
    errors: &mut Vec<DepIssue>,
) {
    let Some(value) = root.get(section) else {
        return;
    };
    let Some(entries) = value.as_object() else {
        errors.push(DepIssue {
            name: section.to_string(),
            code: codes::PKG_PACKAGE_JSON_INVALID,
            message: format!("'{section}' must be an object, got {}", json_type_name(value)),
        });
        return;
    };

    for (name, range) in entries {
        match range.as_str() {
            Some(range) => {
                into.insert(name.clone(), range.to_string());
            }
            None => errors.push(DepIssue {
                name: name.clone(),
                code: codes::PKG_PACKAGE_JSON_INVALID,
                message: format!("expected string range, got {}", json_type_name(range)),
            }),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
