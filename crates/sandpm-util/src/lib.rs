#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared utilities for sandpm.
//!
//! This crate provides pure helper functions with no logging/tracing dependencies.
//! Logging is handled by `sandpm-core` so this crate stays lightweight.

pub mod fs;
pub mod hash;
pub mod ident;
