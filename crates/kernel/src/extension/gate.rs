//! Filesystem and command allowlist enforcement.
//!
//! Every host capability that touches the filesystem or spawns a process
//! goes through [`Gate`]. Decisions are deny-by-default: an extension gets
//! access only when it declared the `system` scope and a manifest allowlist
//! pattern covers the request.

use std::env;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use glob::{MatchOptions, Pattern};
use regex::Regex;
use tracing::warn;

use crate::error::{HostError, HostResult};
use crate::extension::manifest::{CommandArg, ExtensionManifest, Scope};
use crate::state::AppContext;

/// Access mode for path checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    Read,
    Write,
}

/// Placeholders recognized in allowlist patterns, replaced before
/// environment variable expansion. `$SEANIME_ANIME_LIBRARY` can expand to
/// several roots and multiplies the pattern accordingly.
const PLACEHOLDERS: &[&str] = &[
    "$SEANIME_ANIME_LIBRARY",
    "$HOME",
    "$CACHE",
    "$TEMP",
    "$CONFIG",
    "$DOWNLOAD",
    "$DESKTOP",
    "$DOCUMENT",
];

/// Glob options for allowlist matching: `*` and `?` never cross a path
/// separator, `**` does.
const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Regex for `$NAME` / `${NAME}` environment variable references.
///
/// # Panics
///
/// Panics if the hard-coded regex literal is invalid (impossible in practice).
#[allow(clippy::expect_used)]
static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex literal")
});

/// Permission gate evaluating manifest allowlists against concrete
/// paths and command invocations.
#[derive(Clone)]
pub struct Gate {
    ctx: AppContext,
}

impl Gate {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Whether the extension may access `path` in the given mode.
    ///
    /// The path is made absolute (against the current directory if
    /// relative) and normalized to forward slashes before matching
    /// against the expanded allowlist patterns.
    pub fn is_allowed_path(
        &self,
        manifest: &ExtensionManifest,
        path: &Path,
        mode: PathMode,
    ) -> bool {
        if !manifest.has_scope(Scope::System) {
            return false;
        }

        let allowlist = &manifest.permissions.system_allowlist;
        let patterns = match mode {
            PathMode::Read => &allowlist.allow_read_paths,
            PathMode::Write => &allowlist.allow_write_paths,
        };
        if patterns.is_empty() {
            return false;
        }

        let Some(normalized) = normalize(path) else {
            return false;
        };

        for pattern in patterns {
            for resolved in self.resolve_pattern(pattern) {
                let resolved = anchor_relative(resolved, &normalized);
                match Pattern::new(&resolved) {
                    Ok(glob) if glob.matches_with(&normalized, GLOB_OPTIONS) => return true,
                    Ok(_) => {}
                    Err(error) => {
                        warn!(pattern = %resolved, %error, "ignoring invalid allowlist pattern");
                    }
                }
            }
        }

        false
    }

    /// Whether the extension may run `command` with exactly these arguments.
    ///
    /// Scopes are tried in manifest order and the first one whose command
    /// name and argument constraints all pass wins.
    pub fn is_allowed_command(
        &self,
        manifest: &ExtensionManifest,
        command: &str,
        args: &[String],
    ) -> bool {
        if !manifest.has_scope(Scope::System) {
            return false;
        }

        for scope in &manifest.permissions.system_allowlist.command_scopes {
            if scope.command != command {
                continue;
            }
            if scope.args.is_empty() && !args.is_empty() {
                continue;
            }
            if args.len() > scope.args.len() {
                continue;
            }
            if self.args_match(manifest, &scope.args, args) {
                return true;
            }
        }

        false
    }

    /// [`Self::is_allowed_path`] as a result, for call sites that propagate.
    pub fn check_path(
        &self,
        manifest: &ExtensionManifest,
        path: &Path,
        mode: PathMode,
    ) -> HostResult<()> {
        if self.is_allowed_path(manifest, path, mode) {
            Ok(())
        } else {
            Err(HostError::path_not_authorized(path))
        }
    }

    /// [`Self::is_allowed_command`] as a result, for call sites that propagate.
    pub fn check_command(
        &self,
        manifest: &ExtensionManifest,
        command: &str,
        args: &[String],
    ) -> HostResult<()> {
        if self.is_allowed_command(manifest, command, args) {
            Ok(())
        } else {
            Err(HostError::PermissionDenied(format!(
                "command not allowed: {} {}",
                command,
                args.join(" ")
            )))
        }
    }

    fn args_match(&self, manifest: &ExtensionManifest, specs: &[CommandArg], args: &[String]) -> bool {
        for (i, spec) in specs.iter().enumerate() {
            // Fewer arguments than the scope declares never satisfies it.
            let Some(arg) = args.get(i) else {
                return false;
            };

            if let Some(value) = &spec.value {
                if value != arg {
                    return false;
                }
                continue;
            }

            match spec.validator.as_deref() {
                Some("$ARGS") => {}
                Some("$PATH") => {
                    if arg.is_empty()
                        || !self.is_allowed_path(manifest, Path::new(arg), PathMode::Write)
                        || !Path::new(arg).exists()
                    {
                        return false;
                    }
                }
                Some(validator) => {
                    if !full_regex_match(validator, arg) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        true
    }

    /// Expand one allowlist pattern into zero or more concrete patterns.
    ///
    /// Placeholders are replaced first. A placeholder backed by several
    /// paths multiplies the pattern; one backed by none drops it. Remaining
    /// `$NAME` references are replaced from the environment (empty when
    /// unset), then doubled slashes are collapsed.
    fn resolve_pattern(&self, pattern: &str) -> Vec<String> {
        let mut patterns = vec![pattern.to_string()];

        for placeholder in PLACEHOLDERS {
            if !pattern.contains(placeholder) {
                continue;
            }

            let paths: Vec<String> = self
                .placeholder_paths(placeholder.trim_start_matches('$'))
                .iter()
                .map(|p| to_slash(p))
                .collect();

            patterns = patterns
                .into_iter()
                .flat_map(|existing| {
                    paths
                        .iter()
                        .map(|path| existing.replace(placeholder, path))
                        .collect::<Vec<_>>()
                })
                .collect();
        }

        for resolved in &mut patterns {
            *resolved = expand_env(resolved);
            while resolved.contains("//") {
                *resolved = resolved.replace("//", "/");
            }
        }

        patterns
    }

    fn placeholder_paths(&self, name: &str) -> Vec<PathBuf> {
        match name {
            "SEANIME_ANIME_LIBRARY" => self.ctx.anime_library_paths(),
            "HOME" => dirs::home_dir().into_iter().collect(),
            "CACHE" => dirs::cache_dir().into_iter().collect(),
            "TEMP" => vec![env::temp_dir()],
            "CONFIG" => dirs::config_dir().into_iter().collect(),
            "DOWNLOAD" => dirs::download_dir().into_iter().collect(),
            "DESKTOP" => dirs::desktop_dir().into_iter().collect(),
            "DOCUMENT" => dirs::document_dir().into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate").finish_non_exhaustive()
    }
}

/// Absolute, lexically cleaned, forward-slash form of a path.
fn normalize(path: &Path) -> Option<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().ok()?.join(path)
    };
    Some(to_slash(&lexical_clean(&absolute)))
}

pub(crate) fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Resolve `.` and `..` components without touching the filesystem.
pub(crate) fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Anchor a relative pattern to the parent directory of the path being
/// checked. Patterns starting with a wildcard are left alone.
fn anchor_relative(pattern: String, normalized_path: &str) -> String {
    if Path::new(&pattern).is_absolute() || pattern.starts_with('*') {
        return pattern;
    }
    let dir = match normalized_path.rsplit_once('/') {
        Some(("", _)) | None => "",
        Some((dir, _)) => dir,
    };
    format!("{dir}/{pattern}")
}

fn expand_env(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            env::var(name).unwrap_or_default()
        })
        .into_owned()
}

/// Whether the regex matches the entire argument, not just a substring.
fn full_regex_match(pattern: &str, input: &str) -> bool {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => re.is_match(input),
        Err(error) => {
            warn!(%pattern, %error, "ignoring command scope with invalid validator regex");
            false
        }
    }
}
