//! Parser for extension `.manifest.json` files.
//!
//! Each extension has a `{id}.manifest.json` file that declares metadata:
//! - id, name, version, description, author
//! - language and entrypoint (the script file to evaluate)
//! - permission scopes and the system allowlist (paths and commands)

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Extension metadata parsed from `.manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    /// Extension machine id (must match directory and file names).
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Semantic version (e.g., "1.0.0").
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Author name or handle.
    #[serde(default)]
    pub author: String,

    /// Source language of the entrypoint.
    #[serde(default)]
    pub language: Language,

    /// Script file evaluated at load, relative to the extension directory.
    pub entrypoint: String,

    /// Declared permissions.
    #[serde(default)]
    pub permissions: Permissions,
}

/// Source language of an extension entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Javascript,
    Typescript,
}

/// Permissions declared by an extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    /// Capability scopes the extension may use.
    #[serde(default)]
    pub scopes: Vec<Scope>,

    /// Filesystem and command allowlist, required for the `system` scope
    /// to grant anything.
    #[serde(default)]
    pub system_allowlist: SystemAllowlist,
}

/// Capability scopes an extension can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Filesystem read/write and command execution, bounded by the allowlist.
    System,
    /// Persistent key-value storage.
    Storage,
    /// Direct database access.
    Database,
    /// Playback control.
    Playback,
    /// AniList platform access.
    Anilist,
    /// Scheduled background jobs.
    Cron,
}

/// Declared filesystem and command allowlist.
///
/// Patterns support `$HOME`, `$CACHE`, `$TEMP`, `$CONFIG`, `$DOWNLOAD`,
/// `$DESKTOP`, `$DOCUMENT` and `$SEANIME_ANIME_LIBRARY` placeholders plus
/// arbitrary environment variables, and doublestar globs after expansion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAllowlist {
    /// Glob patterns for paths the extension may read.
    #[serde(default)]
    pub allow_read_paths: Vec<String>,

    /// Glob patterns for paths the extension may write.
    #[serde(default)]
    pub allow_write_paths: Vec<String>,

    /// Commands the extension may execute, with per-argument constraints.
    #[serde(default)]
    pub command_scopes: Vec<CommandScope>,
}

/// A single allowed command with argument constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandScope {
    /// What this grant is for, shown to users reviewing permissions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Program name or absolute path, compared verbatim.
    pub command: String,

    /// Positional argument constraints. An invocation may pass at most
    /// this many arguments.
    #[serde(default)]
    pub args: Vec<CommandArg>,
}

/// Constraint on a single command argument position.
///
/// Exactly one of `value` and `validator` must be set. `validator` is a
/// regular expression matched against the whole argument, or one of the
/// sentinels `$ARGS` (any value) and `$PATH` (a writable, existing path).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandArg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
}

impl ExtensionManifest {
    /// Parse a manifest file from the given path.
    pub fn parse(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest file: {}", path.display()))?;

        Self::parse_str(&content, path)
    }

    /// Parse a manifest from a JSON string.
    pub fn parse_str(content: &str, path: &Path) -> Result<Self> {
        let manifest: ExtensionManifest = serde_json::from_str(content)
            .with_context(|| format!("failed to parse manifest JSON at {}", path.display()))?;

        manifest.validate(path)?;
        Ok(manifest)
    }

    /// Whether the extension declared the given scope.
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.permissions.scopes.contains(&scope)
    }

    /// Validate the parsed manifest.
    fn validate(&self, path: &Path) -> Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("manifest at {} has empty 'id' field", path.display());
        }

        if !self
            .id
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            anyhow::bail!(
                "extension '{}' at {} has invalid id: must start with a letter and contain only alphanumeric characters and hyphens",
                self.id,
                path.display()
            );
        }

        if self.name.is_empty() {
            anyhow::bail!(
                "extension '{}' at {} has empty 'name' field",
                self.id,
                path.display()
            );
        }

        if self.version.is_empty() {
            anyhow::bail!(
                "extension '{}' at {} has empty 'version' field",
                self.id,
                path.display()
            );
        }

        if self.entrypoint.is_empty() {
            anyhow::bail!(
                "extension '{}' at {} has empty 'entrypoint' field",
                self.id,
                path.display()
            );
        }

        if self.entrypoint.contains('/') || self.entrypoint.contains('\\') {
            anyhow::bail!(
                "extension '{}' at {} has invalid entrypoint '{}': must name a file in the extension directory, not a path",
                self.id,
                path.display(),
                self.entrypoint
            );
        }

        for scope in &self.permissions.system_allowlist.command_scopes {
            if scope.command.is_empty() {
                anyhow::bail!(
                    "extension '{}' at {} has a command scope with empty 'command' field",
                    self.id,
                    path.display()
                );
            }

            for (i, arg) in scope.args.iter().enumerate() {
                match (&arg.value, &arg.validator) {
                    (Some(_), None) | (None, Some(_)) => {}
                    _ => anyhow::bail!(
                        "extension '{}' at {}: command '{}' argument {} must set exactly one of 'value' and 'validator'",
                        self.id,
                        path.display(),
                        scope.command,
                        i
                    ),
                }
            }
        }

        Ok(())
    }
}
