#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::return_self_not_must_use)]

//! sandpm: a Node-style package manager for sandboxed containers.
//!
//! Resolves a manifest's dependency closure against an npm-compatible
//! registry, materializes a virtual `node_modules` tree through a pluggable
//! filesystem, and records the result in `package-lock.json`.

pub mod config;
pub mod error;
pub mod logging;
pub mod pkg;
pub mod vfs;

pub use config::PmConfig;
pub use error::Error;
pub use pkg::{InstallOptions, InstallResult, PackageManager};
pub use vfs::{DiskFs, MemoryFs, VirtualFs};
