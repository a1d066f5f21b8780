//! Virtual `node_modules` materialization.
//!
//! Every package in a [`ResolutionGraph`] becomes a directory holding a
//! synthesized `package.json` and an entry module that re-exports the
//! package's dependencies. No tarballs are downloaded; the tree only has to
//! be resolvable by code running inside the sandbox.

use super::error::PkgError;
use super::request::validate_name;
use super::resolve::{ResolutionGraph, ResolvedPackage};
use crate::vfs::VirtualFs;
use sandpm_util::ident::sanitize_identifier;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Directory packages are installed under.
pub const NODE_MODULES: &str = "node_modules";

/// Entry module used when a package declares no usable `main`.
pub const DEFAULT_MAIN: &str = "index.js";

const RESERVED_WORDS: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete",
    "do", "else", "enum", "export", "extends", "false", "finally", "for", "function", "if",
    "import", "in", "instanceof", "let", "new", "null", "return", "static", "super", "switch",
    "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// `package.json` written for each installed package. Field order is fixed
/// and every map is sorted.
#[derive(Serialize)]
struct InstalledManifest<'a> {
    name: &'a str,
    version: &'a str,
    main: &'a str,
    exports: Value,
    dependencies: BTreeMap<&'a str, &'a str>,
}

/// Writes a resolution graph into `{root}/node_modules`.
#[derive(Debug, Clone, Copy)]
pub struct VirtualInstaller<'a> {
    vfs: &'a dyn VirtualFs,
}

impl<'a> VirtualInstaller<'a> {
    #[must_use]
    pub fn new(vfs: &'a dyn VirtualFs) -> Self {
        Self { vfs }
    }

    /// Install every package in `graph` under `root`.
    ///
    /// Packages are written in name order. The first failing write aborts the
    /// install; whatever was already written stays in place.
    ///
    /// Returns the package directories that were written.
    ///
    /// # Errors
    /// `NODE_MODULES_WRITE_FAILED` when the filesystem rejects a write, and
    /// `PKG_SPEC_INVALID` for a name that cannot be a directory.
    pub fn install(&self, root: &Path, graph: &ResolutionGraph) -> Result<Vec<PathBuf>, PkgError> {
        let mut written = Vec::with_capacity(graph.len());
        for package in graph.packages() {
            written.push(self.install_package(root, package, graph)?);
        }
        debug!(root = %root.display(), packages = written.len(), "Installed node_modules");
        Ok(written)
    }

    fn install_package(
        &self,
        root: &Path,
        package: &ResolvedPackage,
        graph: &ResolutionGraph,
    ) -> Result<PathBuf, PkgError> {
        validate_name(&package.name)?;
        let dir = package_dir(root, &package.name);
        self.vfs.mkdir(&dir, true).map_err(|e| {
            PkgError::node_modules_write_failed(format!(
                "Failed to create {}: {e}",
                dir.display()
            ))
        })?;

        let (main, entry) = entry_paths(package.main.as_deref());
        self.write(&dir.join("package.json"), &render_manifest(package, &main, graph)?)?;

        let entry_path = dir.join(&entry);
        if let Some(parent) = entry_path.parent().filter(|p| *p != dir.as_path()) {
            self.vfs.mkdir(parent, true).map_err(|e| {
                PkgError::node_modules_write_failed(format!(
                    "Failed to create {}: {e}",
                    parent.display()
                ))
            })?;
        }
        self.write(&entry_path, &render_entry_module(package))?;

        debug!(name = %package.name, version = %package.version, entry = %entry, "Wrote package");
        Ok(dir)
    }

    fn write(&self, path: &Path, contents: &str) -> Result<(), PkgError> {
        self.vfs.write_file(path, contents.as_bytes()).map_err(|e| {
            PkgError::node_modules_write_failed(format!("Failed to write {}: {e}", path.display()))
        })
    }
}

/// `{root}/node_modules/{name}`; scoped names nest under their scope.
#[must_use]
pub fn package_dir(root: &Path, name: &str) -> PathBuf {
    name.split('/')
        .fold(root.join(NODE_MODULES), |dir, part| dir.join(part))
}

/// Pick the `main` field and the file the entry module is written to.
///
/// A declared `main` is kept only when it is a plain relative path. A main
/// without a JavaScript extension resolves to `{main}.js` the way Node does.
fn entry_paths(main: Option<&str>) -> (String, String) {
    let Some(main) = main.map(|m| m.trim_start_matches("./")).filter(|m| is_safe_relative(m))
    else {
        return (DEFAULT_MAIN.to_string(), DEFAULT_MAIN.to_string());
    };

    let has_js_ext = Path::new(main)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e, "js" | "cjs" | "mjs"));
    let entry = if has_js_ext {
        main.to_string()
    } else {
        format!("{main}.js")
    };
    (main.to_string(), entry)
}

fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && !path.ends_with('/')
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn render_manifest(
    package: &ResolvedPackage,
    main: &str,
    graph: &ResolutionGraph,
) -> Result<String, PkgError> {
    let dependencies = package
        .dependencies
        .iter()
        .map(|(name, range)| {
            let version = graph.get(name).map_or(range.as_str(), |p| p.version.as_str());
            (name.as_str(), version)
        })
        .collect();

    let manifest = InstalledManifest {
        name: &package.name,
        version: &package.version,
        main,
        exports: package
            .exports
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new())),
        dependencies,
    };

    let mut json = serde_json::to_string_pretty(&manifest).map_err(|e| {
        PkgError::node_modules_write_failed(format!(
            "Failed to serialize package.json for {}: {e}",
            package.name
        ))
    })?;
    json.push('\n');
    Ok(json)
}

/// CommonJS module that requires each dependency and re-exports it.
fn render_entry_module(package: &ResolvedPackage) -> String {
    let mut out = String::from("'use strict';\n");
    if package.dependencies.is_empty() {
        out.push_str("\nmodule.exports = {};\n");
        return out;
    }

    let bindings = dependency_bindings(package.dependencies.keys().map(String::as_str));
    out.push('\n');
    for (dep, ident) in &bindings {
        let _ = writeln!(out, "const {ident} = require({});", js_string(dep));
    }
    out.push_str("\nmodule.exports = {\n");
    for (dep, ident) in &bindings {
        let _ = writeln!(out, "  {}: {ident},", js_string(dep));
    }
    out.push_str("};\n");
    out
}

/// Pair each dependency name with a unique identifier.
fn dependency_bindings<'n>(names: impl Iterator<Item = &'n str>) -> Vec<(&'n str, String)> {
    let mut taken = HashSet::new();
    names
        .map(|name| {
            let mut base = sanitize_identifier(name);
            if RESERVED_WORDS.contains(&base.as_str()) {
                base.insert(0, '_');
            }
            let mut ident = base.clone();
            let mut n = 2;
            while !taken.insert(ident.clone()) {
                ident = format!("{base}_{n}");
                n += 1;
            }
            (name, ident)
        })
        .collect()
}

fn js_string(s: &str) -> String {
    // JSON string literals are valid JS string literals.
    Value::String(s.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::error::codes;
    use crate::pkg::metadata::VersionRecord;
    use crate::vfs::MemoryFs;
    use chrono::{DateTime, Utc};

    fn package(name: &str, version: &str, extra: serde_json::Value) -> ResolvedPackage {
        let mut doc = serde_json::json!({
            "version": version,
            "dist": { "tarball": format!("https://r.test/{name}.tgz") }
        });
        if let (Some(doc), Some(extra)) = (doc.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                doc.insert(k.clone(), v.clone());
            }
        }
        let record: VersionRecord = serde_json::from_value(doc).unwrap();
        ResolvedPackage::from_record(name, &record, DateTime::<Utc>::UNIX_EPOCH)
    }

    fn read(vfs: &MemoryFs, path: &str) -> String {
        String::from_utf8(vfs.read_file(Path::new(path)).unwrap()).unwrap()
    }

    fn chain_graph() -> ResolutionGraph {
        let mut graph = ResolutionGraph::new();
        graph.insert(package(
            "pkg-a",
            "1.0.0",
            serde_json::json!({ "dependencies": { "pkg-b": "^2.0.0" } }),
        ));
        graph.insert(package("pkg-b", "2.3.0", serde_json::json!({})));
        graph
    }

    #[test]
    fn test_writes_manifest_and_entry() {
        let vfs = MemoryFs::new();
        let written = VirtualInstaller::new(&vfs)
            .install(Path::new("/app"), &chain_graph())
            .unwrap();

        assert_eq!(
            written,
            vec![
                PathBuf::from("/app/node_modules/pkg-a"),
                PathBuf::from("/app/node_modules/pkg-b"),
            ]
        );

        let manifest: Value =
            serde_json::from_str(&read(&vfs, "/app/node_modules/pkg-a/package.json")).unwrap();
        assert_eq!(manifest["name"], "pkg-a");
        assert_eq!(manifest["main"], "index.js");
        assert_eq!(manifest["exports"], serde_json::json!({}));
        assert_eq!(manifest["dependencies"]["pkg-b"], "2.3.0");

        let entry = read(&vfs, "/app/node_modules/pkg-a/index.js");
        assert_eq!(
            entry,
            "'use strict';\n\nconst pkg_b = require(\"pkg-b\");\n\nmodule.exports = {\n  \"pkg-b\": pkg_b,\n};\n"
        );
        assert_eq!(
            read(&vfs, "/app/node_modules/pkg-b/index.js"),
            "'use strict';\n\nmodule.exports = {};\n"
        );
    }

    #[test]
    fn test_manifest_field_order() {
        let vfs = MemoryFs::new();
        VirtualInstaller::new(&vfs)
            .install(Path::new("/app"), &chain_graph())
            .unwrap();
        let json = read(&vfs, "/app/node_modules/pkg-b/package.json");
        let keys: Vec<usize> = ["\"name\"", "\"version\"", "\"main\"", "\"exports\"", "\"dependencies\""]
            .iter()
            .map(|k| json.find(k).unwrap())
            .collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert!(json.ends_with("}\n"));
    }

    #[test]
    fn test_unresolved_dependency_keeps_range() {
        let mut graph = ResolutionGraph::new();
        graph.insert(package(
            "pkg-a",
            "1.0.0",
            serde_json::json!({ "dependencies": { "broken": "^1.0.0" } }),
        ));
        let vfs = MemoryFs::new();
        VirtualInstaller::new(&vfs).install(Path::new("/"), &graph).unwrap();

        let manifest: Value =
            serde_json::from_str(&read(&vfs, "/node_modules/pkg-a/package.json")).unwrap();
        assert_eq!(manifest["dependencies"]["broken"], "^1.0.0");
    }

    #[test]
    fn test_scoped_package_and_custom_main() {
        let mut graph = ResolutionGraph::new();
        graph.insert(package(
            "@scope/util",
            "0.1.0",
            serde_json::json!({ "main": "./lib/main", "exports": { ".": "./lib/main.js" } }),
        ));
        let vfs = MemoryFs::new();
        VirtualInstaller::new(&vfs).install(Path::new("/app"), &graph).unwrap();

        assert!(vfs.exists(Path::new("/app/node_modules/@scope/util/lib/main.js")));
        let manifest: Value =
            serde_json::from_str(&read(&vfs, "/app/node_modules/@scope/util/package.json")).unwrap();
        assert_eq!(manifest["main"], "lib/main");
        assert_eq!(manifest["exports"]["."], "./lib/main.js");
    }

    #[test]
    fn test_unsafe_main_falls_back() {
        assert_eq!(entry_paths(Some("../../etc/passwd")).1, DEFAULT_MAIN);
        assert_eq!(entry_paths(Some("/abs.js")).1, DEFAULT_MAIN);
        assert_eq!(entry_paths(Some("")).1, DEFAULT_MAIN);
        assert_eq!(entry_paths(None).1, DEFAULT_MAIN);
        assert_eq!(entry_paths(Some("dist/index.cjs")).1, "dist/index.cjs");
    }

    #[test]
    fn test_identifier_collisions_and_reserved_words() {
        let bindings = dependency_bindings(["a-b", "a.b", "a_b", "class", "3d"].into_iter());
        let idents: Vec<&str> = bindings.iter().map(|(_, i)| i.as_str()).collect();
        assert_eq!(idents, vec!["a_b", "a_b_2", "a_b_3", "_class", "_3d"]);
    }

    #[test]
    fn test_output_independent_of_insertion_order() {
        let forward = chain_graph();
        let mut backward = ResolutionGraph::new();
        for name in ["pkg-b", "pkg-a"] {
            backward.insert(forward.get(name).unwrap().clone());
        }

        let a = MemoryFs::new();
        let b = MemoryFs::new();
        VirtualInstaller::new(&a).install(Path::new("/app"), &forward).unwrap();
        VirtualInstaller::new(&b).install(Path::new("/app"), &backward).unwrap();

        assert_eq!(a.file_paths(), b.file_paths());
        for path in a.file_paths() {
            assert_eq!(a.read_file(&path).unwrap(), b.read_file(&path).unwrap());
        }
    }

    #[test]
    fn test_write_failure_aborts() {
        let vfs = MemoryFs::new();
        vfs.fail_writes_under("/app/node_modules/pkg-b").unwrap();

        let err = VirtualInstaller::new(&vfs)
            .install(Path::new("/app"), &chain_graph())
            .unwrap_err();
        assert_eq!(err.code(), codes::NODE_MODULES_WRITE_FAILED);
        assert!(err.message().contains("pkg-b"));
        assert!(vfs.exists(Path::new("/app/node_modules/pkg-a/package.json")));
    }

    #[test]
    fn test_rejects_path_like_names() {
        let mut graph = ResolutionGraph::new();
        graph.insert(package("../escape", "1.0.0", serde_json::json!({})));
        let vfs = MemoryFs::new();
        let err = VirtualInstaller::new(&vfs)
            .install(Path::new("/app"), &graph)
            .unwrap_err();
        assert_eq!(err.code(), codes::PKG_SPEC_INVALID);
        assert!(vfs.file_paths().is_empty());
    }
}
