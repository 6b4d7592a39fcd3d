//! Archive extraction for extensions.
//!
//! Archives are unpacked into a hidden staging directory next to the
//! destination, then their top-level entries are moved into place. A
//! half-extracted archive therefore never leaves partial files at the
//! destination.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::error::{HostError, HostResult};
use crate::extension::{ExtensionManifest, Gate, PathMode};

/// Prefix of staging directories created next to the destination.
const STAGING_PREFIX: &str = ".extracted-";

/// Per-extension archive binding.
#[derive(Debug, Clone)]
pub struct ArchiveBinding {
    gate: Gate,
    manifest: Arc<ExtensionManifest>,
}

impl ArchiveBinding {
    pub fn new(gate: Gate, manifest: Arc<ExtensionManifest>) -> Self {
        Self { gate, manifest }
    }

    /// Extract a zip archive into `dest`. Both paths must pass the
    /// write gate. Existing entries at the destination are replaced.
    pub fn unzip(&self, src: &Path, dest: &Path) -> HostResult<()> {
        self.gate.check_path(&self.manifest, src, PathMode::Write)?;
        self.gate.check_path(&self.manifest, dest, PathMode::Write)?;

        let staging = staging_dir(dest)?;
        extract_zip(src, staging.path())?;
        merge_into(staging.path(), dest)?;
        debug!(src = %src.display(), dest = %dest.display(), "unzipped archive");
        Ok(())
    }

    /// Extract a rar archive into `dest`. Both paths must pass the
    /// write gate.
    #[cfg(feature = "rar")]
    pub fn unrar(&self, src: &Path, dest: &Path) -> HostResult<()> {
        self.gate.check_path(&self.manifest, src, PathMode::Write)?;
        self.gate.check_path(&self.manifest, dest, PathMode::Write)?;

        let staging = staging_dir(dest)?;
        extract_rar(src, staging.path())?;
        merge_into(staging.path(), dest)?;
        debug!(src = %src.display(), dest = %dest.display(), "unrarred archive");
        Ok(())
    }

    #[cfg(not(feature = "rar"))]
    pub fn unrar(&self, src: &Path, dest: &Path) -> HostResult<()> {
        self.gate.check_path(&self.manifest, src, PathMode::Write)?;
        self.gate.check_path(&self.manifest, dest, PathMode::Write)?;
        Err(HostError::Unavailable("rar extraction (rar feature)"))
    }

    /// Move the interesting content of `src` into `dest`, unwrapping
    /// single-folder nesting.
    ///
    /// A folder tree like `src/{hash}/Show/Ep1.mkv, Ep2.mkv` moves the
    /// `Show` folder; a tree holding exactly one file moves just that
    /// file. Multiple top-level entries are moved as they are.
    pub fn unwrap_and_move(&self, src: &Path, dest: &Path) -> HostResult<()> {
        self.gate.check_path(&self.manifest, src, PathMode::Write)?;
        self.gate.check_path(&self.manifest, dest, PathMode::Write)?;

        if !src.exists() {
            return Err(HostError::invalid_argument(format!(
                "source directory does not exist: {}",
                src.display()
            )));
        }
        std::fs::create_dir_all(dest).map_err(anyhow::Error::from)?;

        let entries: Vec<_> = std::fs::read_dir(src)
            .map_err(anyhow::Error::from)?
            .collect::<Result<_, _>>()
            .map_err(anyhow::Error::from)?;

        // Several top-level entries: nothing to unwrap.
        if entries.len() > 1 {
            for entry in entries {
                move_to_destination(&entry.path(), dest)?;
            }
            return Ok(());
        }

        let mut counts = HashMap::new();
        folder_child_counts(src, &mut counts)?;

        let mut folder_to_move: Option<PathBuf> = None;
        for (folder, count) in &counts {
            if *count > 1 {
                let shorter = folder_to_move
                    .as_ref()
                    .is_none_or(|current| folder.as_os_str().len() < current.as_os_str().len());
                if shorter {
                    folder_to_move = Some(folder.clone());
                }
            }
        }

        match folder_to_move {
            Some(folder) => move_to_destination(&folder, dest),
            // Single-file tree: move just the file.
            None => match deepest_file(src) {
                Some(file) => move_to_destination(&file, dest),
                None => Err(HostError::invalid_argument(
                    "no files found in the source directory",
                )),
            },
        }
    }
}

fn staging_dir(dest: &Path) -> HostResult<tempfile::TempDir> {
    let parent = dest.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(anyhow::Error::from)?;
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(parent)
        .context("failed to create staging directory")
        .map_err(HostError::Internal)?;
    Ok(staging)
}

fn extract_zip(src: &Path, staging: &Path) -> HostResult<()> {
    let file = std::fs::File::open(src)
        .with_context(|| format!("failed to open zip file {}", src.display()))
        .map_err(HostError::Internal)?;
    let mut archive = zip::ZipArchive::new(file)
        .context("failed to read zip archive")
        .map_err(HostError::Internal)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(anyhow::Error::from)?;
        // Entries escaping the staging root are dropped.
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let out_path = staging.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(anyhow::Error::from)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(anyhow::Error::from)?;
        }
        let mut out = std::fs::File::create(&out_path).map_err(anyhow::Error::from)?;
        std::io::copy(&mut entry, &mut out).map_err(anyhow::Error::from)?;
    }
    Ok(())
}

#[cfg(feature = "rar")]
fn extract_rar(src: &Path, staging: &Path) -> HostResult<()> {
    let mut archive = unrar::Archive::new(src)
        .open_for_processing()
        .map_err(|error| HostError::Internal(anyhow::anyhow!("failed to open rar file: {error}")))?;
    while let Some(header) = archive
        .read_header()
        .map_err(|error| HostError::Internal(anyhow::anyhow!("failed to read rar header: {error}")))?
    {
        archive = if header.entry().is_file() {
            header.extract_with_base(staging).map_err(|error| {
                HostError::Internal(anyhow::anyhow!("failed to extract rar entry: {error}"))
            })?
        } else {
            header.skip().map_err(|error| {
                HostError::Internal(anyhow::anyhow!("failed to skip rar entry: {error}"))
            })?
        };
    }
    Ok(())
}

/// Move every top-level staging entry into the destination, replacing
/// entries already there.
fn merge_into(staging: &Path, dest: &Path) -> HostResult<()> {
    std::fs::create_dir_all(dest).map_err(anyhow::Error::from)?;
    for entry in std::fs::read_dir(staging).map_err(anyhow::Error::from)? {
        let entry = entry.map_err(anyhow::Error::from)?;
        let target = dest.join(entry.file_name());
        if target.is_dir() {
            std::fs::remove_dir_all(&target).map_err(anyhow::Error::from)?;
        } else if target.exists() {
            std::fs::remove_file(&target).map_err(anyhow::Error::from)?;
        }
        std::fs::rename(entry.path(), &target).map_err(anyhow::Error::from)?;
    }
    Ok(())
}

fn move_to_destination(src: &Path, dest: &Path) -> HostResult<()> {
    std::fs::create_dir_all(dest).map_err(anyhow::Error::from)?;
    let name = src
        .file_name()
        .ok_or_else(|| HostError::invalid_argument("source path has no name"))?;
    std::fs::rename(src, dest.join(name)).map_err(anyhow::Error::from)?;
    Ok(())
}

fn folder_child_counts(root: &Path, counts: &mut HashMap<PathBuf, usize>) -> HostResult<()> {
    for entry in std::fs::read_dir(root).map_err(anyhow::Error::from)? {
        let entry = entry.map_err(anyhow::Error::from)?;
        *counts.entry(root.to_path_buf()).or_default() += 1;
        if entry.file_type().map_err(anyhow::Error::from)?.is_dir() {
            folder_child_counts(&entry.path(), counts)?;
        }
    }
    Ok(())
}

/// First file found walking depth-first.
fn deepest_file(root: &Path) -> Option<PathBuf> {
    for entry in std::fs::read_dir(root).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(file) = deepest_file(&path) {
                return Some(file);
            }
        } else {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::extension::{Language, Permissions, Scope, SystemAllowlist};
    use crate::state::AppContext;
    use std::io::Write;

    fn binding(root: &Path) -> ArchiveBinding {
        let patterns = vec![
            root.display().to_string(),
            format!("{}/**", root.display()),
        ];
        let manifest = ExtensionManifest {
            id: "archive-test".into(),
            name: "Archive Test".into(),
            version: "1.0.0".into(),
            description: String::new(),
            author: String::new(),
            language: Language::Javascript,
            entrypoint: "archive-test.js".into(),
            permissions: Permissions {
                scopes: vec![Scope::System],
                system_allowlist: SystemAllowlist {
                    allow_write_paths: patterns,
                    ..Default::default()
                },
            },
        };
        ArchiveBinding::new(Gate::new(AppContext::new()), Arc::new(manifest))
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn unzip_preserves_structure_and_replaces_existing() {
        let temp = tempfile::tempdir().unwrap();
        let archives = binding(temp.path());

        let zip_path = temp.path().join("bundle.zip");
        write_zip(
            &zip_path,
            &[("folder/inner.txt", b"inner"), ("top.txt", b"top")],
        );

        let dest = temp.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("top.txt"), b"stale").unwrap();

        archives.unzip(&zip_path, &dest).unwrap();

        assert_eq!(std::fs::read(dest.join("top.txt")).unwrap(), b"top");
        assert_eq!(
            std::fs::read(dest.join("folder/inner.txt")).unwrap(),
            b"inner"
        );
        // No staging directory left behind.
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn unzip_requires_write_authorization() {
        let temp = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let archives = binding(temp.path());

        let zip_path = temp.path().join("bundle.zip");
        write_zip(&zip_path, &[("a.txt", b"a")]);

        let denied = archives.unzip(&zip_path, &other.path().join("out"));
        assert!(matches!(denied, Err(HostError::PathNotAuthorized { .. })));
    }

    #[test]
    fn unwrap_and_move_lifts_wrapped_folder() {
        let temp = tempfile::tempdir().unwrap();
        let archives = binding(temp.path());

        // src/{hash}/Show/{Ep1,Ep2}
        let show = temp.path().join("src/abc123/Show");
        std::fs::create_dir_all(&show).unwrap();
        std::fs::write(show.join("Ep1.mkv"), b"1").unwrap();
        std::fs::write(show.join("Ep2.mkv"), b"2").unwrap();

        let dest = temp.path().join("dest");
        archives
            .unwrap_and_move(&temp.path().join("src"), &dest)
            .unwrap();

        assert!(dest.join("Show/Ep1.mkv").exists());
        assert!(dest.join("Show/Ep2.mkv").exists());
    }

    #[test]
    fn unwrap_and_move_single_file_moves_the_file() {
        let temp = tempfile::tempdir().unwrap();
        let archives = binding(temp.path());

        let deep = temp.path().join("src/abc123/Show");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("Ep1.mkv"), b"1").unwrap();

        let dest = temp.path().join("dest");
        archives
            .unwrap_and_move(&temp.path().join("src"), &dest)
            .unwrap();

        assert!(dest.join("Ep1.mkv").exists());
        assert!(!dest.join("Show").exists());
    }

    #[test]
    fn unwrap_and_move_multiple_roots_moves_them_all() {
        let temp = tempfile::tempdir().unwrap();
        let archives = binding(temp.path());

        let src = temp.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"a").unwrap();
        std::fs::write(src.join("b.txt"), b"b").unwrap();

        let dest = temp.path().join("dest");
        archives.unwrap_and_move(&src, &dest).unwrap();

        assert!(dest.join("a.txt").exists());
        assert!(dest.join("b.txt").exists());
    }

    #[test]
    fn unwrap_and_move_missing_source_fails() {
        let temp = tempfile::tempdir().unwrap();
        let archives = binding(temp.path());
        let result =
            archives.unwrap_and_move(&temp.path().join("nope"), &temp.path().join("dest"));
        assert!(result.is_err());
    }
}
