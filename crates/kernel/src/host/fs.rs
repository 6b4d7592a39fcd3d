//! Path manipulation helpers.
//!
//! Everything here except [`FsBinding::glob`] and [`FsBinding::walk`] is
//! a pure string transform; the two traversal operations require the
//! base path to pass the read gate.

use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};
use std::sync::Arc;

use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

use crate::error::{HostError, HostResult};
use crate::extension::{lexical_clean, to_slash, ExtensionManifest, Gate, PathMode};

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Last element of a path. Mirrors the usual lexical rules: an empty
/// path yields `"."` and a pure separator path yields `"/"`.
pub fn base(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let trimmed = path.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rsplit(['/', '\\']).next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => trimmed.to_string(),
    }
}

/// Lexically clean a path: resolve `.` and `..`, drop duplicate
/// separators.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let cleaned = lexical_clean(Path::new(path));
    if cleaned.as_os_str().is_empty() {
        ".".to_string()
    } else {
        cleaned.to_string_lossy().into_owned()
    }
}

/// Directory portion of a path, without the trailing element.
pub fn dir(path: &str) -> String {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            parent.to_string_lossy().into_owned()
        }
        Some(_) => ".".to_string(),
        // Root paths are their own directory.
        None => path.to_string(),
    }
}

/// File extension including the leading dot, or an empty string.
pub fn ext(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

/// Replace forward slashes with the platform separator.
pub fn from_slash(path: &str) -> String {
    path.replace('/', &MAIN_SEPARATOR.to_string())
}

/// Replace the platform separator with forward slashes.
pub fn to_slash_str(path: &str) -> String {
    to_slash(Path::new(path))
}

pub fn is_abs(path: &str) -> bool {
    Path::new(path).is_absolute()
}

/// Join path segments, skipping empty ones, and clean the result.
pub fn join(segments: &[&str]) -> String {
    let mut out = PathBuf::new();
    for segment in segments {
        if !segment.is_empty() {
            out.push(segment);
        }
    }
    if out.as_os_str().is_empty() {
        String::new()
    } else {
        clean(&out.to_string_lossy())
    }
}

/// Whether `name` matches the doublestar pattern. `*` stays within one
/// path element; `**` crosses separators.
pub fn matches(pattern: &str, name: &str) -> HostResult<bool> {
    let pattern = Pattern::new(pattern)
        .map_err(|error| HostError::invalid_argument(format!("invalid pattern: {error}")))?;
    Ok(pattern.matches_with(name, GLOB_OPTIONS))
}

/// Relative path from `base_path` to `target`, or an error when one
/// cannot be computed lexically.
pub fn rel(base_path: &str, target: &str) -> HostResult<String> {
    let base_clean = lexical_clean(Path::new(base_path));
    let target_clean = lexical_clean(Path::new(target));

    if base_clean == target_clean {
        return Ok(".".to_string());
    }

    let base_components: Vec<Component<'_>> = base_clean.components().collect();
    let target_components: Vec<Component<'_>> = target_clean.components().collect();

    // A relative result only exists when both sides are anchored the
    // same way.
    if base_clean.is_absolute() != target_clean.is_absolute() {
        return Err(HostError::invalid_argument(format!(
            "cannot make {target} relative to {base_path}"
        )));
    }

    let common = base_components
        .iter()
        .zip(target_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base_components.len() {
        out.push("..");
    }
    for component in &target_components[common..] {
        out.push(component.as_os_str());
    }
    Ok(out.to_string_lossy().into_owned())
}

/// Split a path into its directory (with trailing separator) and file
/// parts.
pub fn split(path: &str) -> (String, String) {
    match path.rfind(['/', '\\']) {
        Some(idx) => (path[..=idx].to_string(), path[idx + 1..].to_string()),
        None => (String::new(), path.to_string()),
    }
}

/// Split a `PATH`-style list on the platform separator.
pub fn split_list(list: &str) -> Vec<String> {
    if list.is_empty() {
        return Vec::new();
    }
    let separator = if cfg!(windows) { ';' } else { ':' };
    list.split(separator).map(str::to_string).collect()
}

/// Gated traversal operations. The pure helpers above need no
/// authorization; these walk real directories.
#[derive(Debug, Clone)]
pub struct FsBinding {
    gate: Gate,
    manifest: Arc<ExtensionManifest>,
}

impl FsBinding {
    pub fn new(gate: Gate, manifest: Arc<ExtensionManifest>) -> Self {
        Self { gate, manifest }
    }

    /// Paths under `base_path` whose base-relative form matches the
    /// doublestar pattern. The base must pass the read gate.
    pub fn glob(&self, base_path: &Path, pattern: &str) -> HostResult<Vec<String>> {
        self.gate
            .check_path(&self.manifest, base_path, PathMode::Read)?;
        let pattern = Pattern::new(pattern)
            .map_err(|error| HostError::invalid_argument(format!("invalid pattern: {error}")))?;

        let mut matched = Vec::new();
        for entry in WalkDir::new(base_path).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                // Unreadable subtrees are skipped, not fatal.
                Err(_) => continue,
            };
            let Ok(relative) = entry.path().strip_prefix(base_path) else {
                continue;
            };
            let candidate = to_slash(relative);
            if pattern.matches_with(&candidate, GLOB_OPTIONS) {
                matched.push(candidate);
            }
        }
        matched.sort();
        Ok(matched)
    }

    /// Every path under `root`, files and directories, in walk order.
    /// The root must pass the read gate.
    pub fn walk(&self, root: &Path) -> HostResult<Vec<String>> {
        self.gate.check_path(&self.manifest, root, PathMode::Read)?;
        let mut paths = Vec::new();
        for entry in WalkDir::new(root) {
            let entry =
                entry.map_err(|error| HostError::Internal(anyhow::Error::new(error)))?;
            paths.push(to_slash(entry.path()));
        }
        Ok(paths)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::extension::{Language, Permissions, Scope, SystemAllowlist};
    use crate::state::AppContext;

    fn binding(read_paths: Vec<String>) -> FsBinding {
        let manifest = ExtensionManifest {
            id: "fs-test".into(),
            name: "Fs Test".into(),
            version: "1.0.0".into(),
            description: String::new(),
            author: String::new(),
            language: Language::Javascript,
            entrypoint: "fs-test.js".into(),
            permissions: Permissions {
                scopes: vec![Scope::System],
                system_allowlist: SystemAllowlist {
                    allow_read_paths: read_paths,
                    ..Default::default()
                },
            },
        };
        FsBinding::new(Gate::new(AppContext::new()), Arc::new(manifest))
    }

    #[test]
    fn base_returns_last_element() {
        assert_eq!(base("/foo/bar.txt"), "bar.txt");
        assert_eq!(base("/foo/bar/"), "bar");
        assert_eq!(base("bar"), "bar");
        assert_eq!(base(""), ".");
        assert_eq!(base("/"), "/");
    }

    #[test]
    fn clean_resolves_dots() {
        assert_eq!(clean("/a/b/../c/./d"), "/a/c/d");
        assert_eq!(clean("a//b"), "a/b");
        assert_eq!(clean(""), ".");
    }

    #[test]
    fn dir_and_split_agree_on_separator_position() {
        assert_eq!(dir("/a/b/c.txt"), "/a/b");
        assert_eq!(dir("c.txt"), ".");
        let (d, f) = split("/a/b/c.txt");
        assert_eq!(d, "/a/b/");
        assert_eq!(f, "c.txt");
        let (d, f) = split("c.txt");
        assert_eq!(d, "");
        assert_eq!(f, "c.txt");
    }

    #[test]
    fn ext_includes_leading_dot() {
        assert_eq!(ext("/a/video.mkv"), ".mkv");
        assert_eq!(ext("/a/noext"), "");
    }

    #[test]
    fn join_skips_empty_segments() {
        assert_eq!(join(&["/a", "", "b", "c.txt"]), "/a/b/c.txt");
        assert_eq!(join(&[]), "");
    }

    #[test]
    fn rel_walks_up_and_down() {
        assert_eq!(rel("/a/b", "/a/b/c/d").unwrap(), "c/d");
        assert_eq!(rel("/a/b/c", "/a/d").unwrap(), "../../d");
        assert_eq!(rel("/a/b", "/a/b").unwrap(), ".");
        assert!(rel("/a", "b").is_err());
    }

    #[test]
    fn matches_keeps_single_star_within_element() {
        assert!(matches("*.mkv", "ep1.mkv").unwrap());
        assert!(!matches("*.mkv", "sub/ep1.mkv").unwrap());
        assert!(matches("**/*.mkv", "sub/deep/ep1.mkv").unwrap());
        assert!(matches("[", "anything").is_err());
    }

    #[test]
    fn split_list_uses_platform_separator() {
        let list = if cfg!(windows) { "/a;/b" } else { "/a:/b" };
        assert_eq!(split_list(list), vec!["/a", "/b"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn glob_requires_read_authorization() {
        let temp = tempfile::tempdir().unwrap();
        let binding = binding(vec![]);
        assert!(binding.glob(temp.path(), "**/*.txt").is_err());
    }

    #[test]
    fn glob_matches_relative_to_base() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        std::fs::write(temp.path().join("top.txt"), b"x").unwrap();
        std::fs::write(temp.path().join("sub/inner.txt"), b"x").unwrap();
        std::fs::write(temp.path().join("sub/other.log"), b"x").unwrap();

        let binding = binding(vec![
            temp.path().display().to_string(),
            format!("{}/**", temp.path().display()),
        ]);

        let hits = binding.glob(temp.path(), "**/*.txt").unwrap();
        assert_eq!(hits, vec!["sub/inner.txt", "top.txt"]);

        let top_only = binding.glob(temp.path(), "*.txt").unwrap();
        assert_eq!(top_only, vec!["top.txt"]);
    }

    #[test]
    fn walk_lists_everything_under_root() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("sub")).unwrap();
        std::fs::write(temp.path().join("sub/file"), b"x").unwrap();

        let binding = binding(vec![
            temp.path().display().to_string(),
            format!("{}/**", temp.path().display()),
        ]);

        let paths = binding.walk(temp.path()).unwrap();
        assert!(paths.iter().any(|p| p.ends_with("/sub/file")));
        assert!(paths.iter().any(|p| p.ends_with("/sub")));
    }
}
