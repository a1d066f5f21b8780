//! Registry metadata documents ("packuments").
//!
//! Only the fields the resolver and installer consume are modeled; unknown
//! fields are ignored so full npm documents parse fine.

use super::error::PkgError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-package registry response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(default)]
    pub name: Option<String>,
    /// Named pointers to versions (e.g. `latest`).
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionRecord>,
}

/// One published version of a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    #[serde(default)]
    pub version: String,
    /// Declared dependencies (name -> range). Non-string ranges are dropped.
    #[serde(default, deserialize_with = "string_map")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dist: Dist,
    /// Entry point. Non-string values (old publishes used arrays) read as absent.
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exports: Option<Value>,
    /// Lifecycle scripts; only install hooks matter to the policy gate.
    #[serde(default, deserialize_with = "string_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
}

/// Distribution info for a version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dist {
    #[serde(default)]
    pub tarball: String,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
}

impl Dist {
    /// Integrity string, falling back to the legacy shasum.
    #[must_use]
    pub fn integrity_or_shasum(&self) -> Option<&str> {
        self.integrity.as_deref().or(self.shasum.as_deref())
    }
}

/// Keep only string-valued members of a JSON object; tolerate `null`.
fn string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) => Some(s),
        _ => None,
    }))
}

impl PackageMetadata {
    /// Parse a registry document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PkgError> {
        let mut metadata: Self = serde_json::from_slice(bytes)?;
        for (version, record) in &mut metadata.versions {
            if record.version.is_empty() {
                record.version.clone_from(version);
            }
        }
        Ok(metadata)
    }

    /// The version the `latest` dist-tag points to.
    #[must_use]
    pub fn latest_version(&self) -> Option<&str> {
        self.dist_tags.get("latest").map(String::as_str)
    }

    /// Select the version to install.
    ///
    /// Always the `latest` dist-tag: version hints are accepted upstream but
    /// not solved against available versions.
    pub fn select_latest(&self, name: &str) -> Result<&VersionRecord, PkgError> {
        let latest = self
            .latest_version()
            .ok_or_else(|| PkgError::version_not_found(name, "dist-tags.latest"))?;
        self.versions
            .get(latest)
            .ok_or_else(|| PkgError::version_not_found(name, latest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static [u8] {
        br#"{
            "name": "react",
            "dist-tags": { "latest": "18.2.0", "next": "19.0.0-rc.0" },
            "versions": {
                "18.2.0": {
                    "dependencies": { "loose-envify": "^1.1.0", "weird": 42 },
                    "dist": {
                        "tarball": "https://registry.npmjs.org/react/-/react-18.2.0.tgz",
                        "shasum": "555bd98592883255fa00de14f1151a917b5d77d5"
                    },
                    "scripts": { "postinstall": "node setup.js" }
                },
                "17.0.2": {
                    "version": "17.0.2",
                    "dependencies": null,
                    "dist": { "tarball": "t", "integrity": "sha512-abc" }
                }
            },
            "readme": "ignored"
        }"#
    }

    #[test]
    fn test_parse_packument() {
        let meta = PackageMetadata::from_slice(sample()).unwrap();
        assert_eq!(meta.name.as_deref(), Some("react"));
        assert_eq!(meta.latest_version(), Some("18.2.0"));

        let record = &meta.versions["18.2.0"];
        assert_eq!(record.version, "18.2.0");
        assert_eq!(record.dependencies.len(), 1);
        assert_eq!(record.dependencies["loose-envify"], "^1.1.0");
        assert_eq!(record.scripts["postinstall"], "node setup.js");
        assert!(meta.versions["17.0.2"].dependencies.is_empty());
    }

    #[test]
    fn test_select_latest() {
        let meta = PackageMetadata::from_slice(sample()).unwrap();
        assert_eq!(meta.select_latest("react").unwrap().version, "18.2.0");
    }

    #[test]
    fn test_select_latest_missing_tag() {
        let meta = PackageMetadata::from_slice(br#"{"versions": {"1.0.0": {}}}"#).unwrap();
        let err = meta.select_latest("x").unwrap_err();
        assert_eq!(err.code(), super::super::error::codes::PKG_VERSION_NOT_FOUND);
    }

    #[test]
    fn test_select_latest_dangling_tag() {
        let meta =
            PackageMetadata::from_slice(br#"{"dist-tags": {"latest": "2.0.0"}, "versions": {}}"#)
                .unwrap();
        let err = meta.select_latest("x").unwrap_err();
        assert!(err.message().contains("2.0.0"));
    }

    #[test]
    fn test_integrity_fallback() {
        let meta = PackageMetadata::from_slice(sample()).unwrap();
        assert_eq!(
            meta.versions["18.2.0"].dist.integrity_or_shasum(),
            Some("555bd98592883255fa00de14f1151a917b5d77d5")
        );
        assert_eq!(
            meta.versions["17.0.2"].dist.integrity_or_shasum(),
            Some("sha512-abc")
        );
    }

    #[test]
    fn test_malformed_fields_in_old_versions_are_tolerated() {
        let meta = PackageMetadata::from_slice(
            br#"{
                "dist-tags": {"latest": "2.0.0"},
                "versions": {
                    "0.0.1": {"main": ["index.js"], "dist": {"shasum": 7}},
                    "2.0.0": {"main": "lib/index.js"}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(meta.versions["0.0.1"].main, None);
        assert_eq!(meta.versions["0.0.1"].dist.integrity_or_shasum(), None);
        let latest = meta.select_latest("old-pkg").unwrap();
        assert_eq!(latest.version, "2.0.0");
        assert_eq!(latest.main.as_deref(), Some("lib/index.js"));
    }

    #[test]
    fn test_invalid_json() {
        let err = PackageMetadata::from_slice(b"<html>").unwrap_err();
        assert_eq!(err.code(), super::super::error::codes::PKG_REGISTRY_ERROR);
    }
}
