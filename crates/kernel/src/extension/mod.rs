//! Extension system for Ayame.
//!
//! This module handles:
//! - Parsing extension metadata from `.manifest.json` files
//! - Enforcing filesystem and command allowlists
//! - Hosting each extension's script engine behind a dedicated scheduler

mod error;
mod gate;
mod manifest;
mod runtime;

pub use error::ExtensionError;
pub use gate::{Gate, PathMode};
pub(crate) use gate::{lexical_clean, to_slash};
pub use manifest::{
    CommandArg, CommandScope, ExtensionManifest, Language, Permissions, Scope, SystemAllowlist,
};
pub use runtime::{
    with_engine, EngineFactory, Extension, ExtensionHost, ExtensionRuntime, RuntimeOptions,
    ScriptEngine,
};
