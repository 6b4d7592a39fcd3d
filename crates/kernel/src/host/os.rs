//! Gated filesystem and subprocess operations.
//!
//! Every path that reaches the real filesystem goes through the
//! permission gate first; commands go through the command allowlist.
//! Subprocesses run under the host process identity, so the gate is the
//! only authorization boundary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{HostError, HostResult};
use crate::extension::{ExtensionManifest, Gate, PathMode};
use crate::scheduler::Scheduler;
use crate::state::AppContext;

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// File metadata returned by [`OsBinding::stat`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    /// Unix permission bits; zero on other platforms.
    pub mode: u32,
    pub modified: Option<DateTime<Utc>>,
}

/// Event delivered to a streaming command callback, always on the
/// scheduler worker.
#[derive(Debug, Clone)]
pub enum CmdEvent {
    /// One line of standard output.
    Stdout(String),
    /// One line of standard error.
    Stderr(String),
    /// The process exited. Sent last, after all line events.
    Exit { code: i32, description: String },
}

type OnCmdEvent = dyn Fn(CmdEvent) + Send + Sync;

/// An authorized command line. Obtained from [`OsBinding::cmd`]; holding
/// one proves the allowlist check passed.
#[derive(Debug, Clone)]
pub struct CmdLine {
    program: String,
    args: Vec<String>,
    scheduler: Scheduler,
    handle: Handle,
}

/// Handle to a running streamed command.
#[derive(Debug, Clone)]
pub struct CmdHandle {
    cancel: CancellationToken,
}

impl CmdHandle {
    /// Kill the process. The exit event still fires.
    pub fn kill(&self) {
        self.cancel.cancel();
    }
}

impl CmdLine {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Run to completion and capture stdout/stderr.
    pub fn output(&self) -> HostResult<std::process::Output> {
        let output = std::process::Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(anyhow::Error::from)?;
        Ok(output)
    }

    /// Spawn the process and stream its output line by line.
    ///
    /// Each stdout/stderr line and the final exit status are delivered
    /// through `on_event` as scheduler jobs, so the callback may touch
    /// engine state.
    pub fn run(&self, on_event: impl Fn(CmdEvent) + Send + Sync + 'static) -> HostResult<CmdHandle> {
        let on_event: Arc<OnCmdEvent> = Arc::new(on_event);
        let cancel = CancellationToken::new();

        // Spawning registers a child watcher with the reactor.
        let _guard = self.handle.enter();
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(anyhow::Error::from)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Internal(anyhow::anyhow!("child stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HostError::Internal(anyhow::anyhow!("child stderr not captured")))?;

        trace!(program = %self.program, "streaming command started");

        let scheduler = self.scheduler.clone();
        let supervisor_cancel = cancel.clone();
        self.handle.spawn(async move {
            let out_pump = tokio::spawn(pump_lines(
                stdout,
                scheduler.clone(),
                Arc::clone(&on_event),
                false,
            ));
            let err_pump = tokio::spawn(pump_lines(
                stderr,
                scheduler.clone(),
                Arc::clone(&on_event),
                true,
            ));

            let status = tokio::select! {
                status = child.wait() => status,
                () = supervisor_cancel.cancelled() => {
                    let _ = child.kill().await;
                    child.wait().await
                }
            };

            // All line events are queued before the exit event.
            let _ = out_pump.await;
            let _ = err_pump.await;

            let (code, description) = match status {
                Ok(status) => (status.code().unwrap_or(-1), status.to_string()),
                Err(error) => (-1, error.to_string()),
            };
            scheduler.schedule_async(move || {
                on_event(CmdEvent::Exit { code, description });
                Ok(())
            });
        });

        Ok(CmdHandle { cancel })
    }
}

async fn pump_lines<R>(reader: R, scheduler: Scheduler, on_event: Arc<OnCmdEvent>, is_stderr: bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let on_event = Arc::clone(&on_event);
        scheduler.schedule_async(move || {
            on_event(if is_stderr {
                CmdEvent::Stderr(line)
            } else {
                CmdEvent::Stdout(line)
            });
            Ok(())
        });
    }
}

/// Per-extension OS binding.
#[derive(Debug, Clone)]
pub struct OsBinding {
    gate: Gate,
    manifest: Arc<ExtensionManifest>,
    ctx: AppContext,
    scheduler: Scheduler,
    handle: Handle,
}

impl OsBinding {
    pub fn new(
        gate: Gate,
        manifest: Arc<ExtensionManifest>,
        ctx: AppContext,
        scheduler: Scheduler,
        handle: Handle,
    ) -> Self {
        Self {
            gate,
            manifest,
            ctx,
            scheduler,
            handle,
        }
    }

    pub fn platform(&self) -> &'static str {
        std::env::consts::OS
    }

    pub fn arch(&self) -> &'static str {
        std::env::consts::ARCH
    }

    /// Build a command handle, if the command line passes the allowlist.
    pub fn cmd(&self, program: &str, args: &[String]) -> HostResult<CmdLine> {
        self.gate.check_command(&self.manifest, program, args)?;
        Ok(CmdLine {
            program: program.to_string(),
            args: args.to_vec(),
            scheduler: self.scheduler.clone(),
            handle: self.handle.clone(),
        })
    }

    pub fn read_file(&self, path: &Path) -> HostResult<Vec<u8>> {
        self.gate.check_path(&self.manifest, path, PathMode::Read)?;
        Ok(std::fs::read(path).map_err(anyhow::Error::from)?)
    }

    pub fn write_file(&self, path: &Path, data: &[u8]) -> HostResult<()> {
        self.gate.check_path(&self.manifest, path, PathMode::Write)?;
        std::fs::write(path, data).map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub fn read_dir(&self, path: &Path) -> HostResult<Vec<DirEntry>> {
        self.gate.check_path(&self.manifest, path, PathMode::Read)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path).map_err(anyhow::Error::from)? {
            let entry = entry.map_err(anyhow::Error::from)?;
            let metadata = entry.metadata().map_err(anyhow::Error::from)?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn temp_dir(&self) -> HostResult<PathBuf> {
        let dir = std::env::temp_dir();
        self.gate.check_path(&self.manifest, &dir, PathMode::Read)?;
        Ok(dir)
    }

    pub fn home_dir(&self) -> HostResult<PathBuf> {
        let dir = dirs::home_dir()
            .ok_or(HostError::Unavailable("home directory"))?;
        self.gate.check_path(&self.manifest, &dir, PathMode::Read)?;
        Ok(dir)
    }

    pub fn config_dir(&self) -> HostResult<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or(HostError::Unavailable("config directory"))?;
        self.gate.check_path(&self.manifest, &dir, PathMode::Read)?;
        Ok(dir)
    }

    pub fn cache_dir(&self) -> HostResult<PathBuf> {
        let dir = dirs::cache_dir()
            .ok_or(HostError::Unavailable("cache directory"))?;
        self.gate.check_path(&self.manifest, &dir, PathMode::Read)?;
        Ok(dir)
    }

    pub fn download_dir(&self) -> HostResult<PathBuf> {
        let dir = dirs::download_dir()
            .ok_or(HostError::Unavailable("download directory"))?;
        self.gate.check_path(&self.manifest, &dir, PathMode::Read)?;
        Ok(dir)
    }

    pub fn desktop_dir(&self) -> HostResult<PathBuf> {
        let dir = dirs::desktop_dir()
            .ok_or(HostError::Unavailable("desktop directory"))?;
        self.gate.check_path(&self.manifest, &dir, PathMode::Read)?;
        Ok(dir)
    }

    pub fn document_dir(&self) -> HostResult<PathBuf> {
        let dir = dirs::document_dir()
            .ok_or(HostError::Unavailable("document directory"))?;
        self.gate.check_path(&self.manifest, &dir, PathMode::Read)?;
        Ok(dir)
    }

    /// Configured anime library roots. Every root must pass the read
    /// gate; an empty configuration yields an empty list.
    pub fn library_dirs(&self) -> HostResult<Vec<PathBuf>> {
        let dirs = self.ctx.anime_library_paths();
        for dir in &dirs {
            self.gate.check_path(&self.manifest, dir, PathMode::Read)?;
        }
        Ok(dirs)
    }

    pub fn truncate(&self, path: &Path, size: u64) -> HostResult<()> {
        self.gate.check_path(&self.manifest, path, PathMode::Write)?;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(anyhow::Error::from)?;
        file.set_len(size).map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub fn mkdir(&self, path: &Path) -> HostResult<()> {
        self.gate.check_path(&self.manifest, path, PathMode::Write)?;
        std::fs::create_dir(path).map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub fn mkdir_all(&self, path: &Path) -> HostResult<()> {
        self.gate.check_path(&self.manifest, path, PathMode::Write)?;
        std::fs::create_dir_all(path).map_err(anyhow::Error::from)?;
        Ok(())
    }

    /// Rename a file or directory. Both ends must be write-authorized.
    pub fn rename(&self, from: &Path, to: &Path) -> HostResult<()> {
        self.gate.check_path(&self.manifest, from, PathMode::Write)?;
        self.gate.check_path(&self.manifest, to, PathMode::Write)?;
        std::fs::rename(from, to).map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub fn remove(&self, path: &Path) -> HostResult<()> {
        self.gate.check_path(&self.manifest, path, PathMode::Write)?;
        let result = if path.is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        };
        result.map_err(anyhow::Error::from)?;
        Ok(())
    }

    /// Remove a path and everything under it. Missing paths are not an
    /// error.
    pub fn remove_all(&self, path: &Path) -> HostResult<()> {
        self.gate.check_path(&self.manifest, path, PathMode::Write)?;
        let result = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            match std::fs::remove_file(path) {
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        };
        result.map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub fn stat(&self, path: &Path) -> HostResult<FileStat> {
        self.gate.check_path(&self.manifest, path, PathMode::Read)?;
        let metadata = std::fs::metadata(path).map_err(anyhow::Error::from)?;

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = 0;

        Ok(FileStat {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: metadata.len(),
            is_dir: metadata.is_dir(),
            mode,
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::extension::{
        CommandArg, CommandScope, Language, Permissions, Scope, SystemAllowlist,
    };
    use crate::state::{AppContext, AppContextModules};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn binding(allowlist: SystemAllowlist) -> OsBinding {
        binding_with_ctx(allowlist, AppContext::new())
    }

    fn binding_with_ctx(allowlist: SystemAllowlist, ctx: AppContext) -> OsBinding {
        let manifest = ExtensionManifest {
            id: "os-test".into(),
            name: "Os Test".into(),
            version: "1.0.0".into(),
            description: String::new(),
            author: String::new(),
            language: Language::Javascript,
            entrypoint: "os-test.js".into(),
            permissions: Permissions {
                scopes: vec![Scope::System],
                system_allowlist: allowlist,
            },
        };
        OsBinding::new(
            Gate::new(ctx.clone()),
            Arc::new(manifest),
            ctx,
            Scheduler::new("os-test").unwrap(),
            Handle::current(),
        )
    }

    fn allow_tree(root: &Path) -> SystemAllowlist {
        SystemAllowlist {
            allow_read_paths: vec![
                root.display().to_string(),
                format!("{}/**", root.display()),
            ],
            allow_write_paths: vec![
                root.display().to_string(),
                format!("{}/**", root.display()),
            ],
            command_scopes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn file_operations_respect_the_gate() {
        let temp = tempfile::tempdir().unwrap();
        let os = binding(allow_tree(temp.path()));

        let allowed = temp.path().join("note.txt");
        os.write_file(&allowed, b"hello").unwrap();
        assert_eq!(os.read_file(&allowed).unwrap(), b"hello");

        let denied = os.write_file(Path::new("/somewhere/else.txt"), b"x");
        assert!(matches!(denied, Err(HostError::PathNotAuthorized { .. })));
        let denied = os.read_file(Path::new("/etc/hostname"));
        assert!(matches!(denied, Err(HostError::PathNotAuthorized { .. })));
    }

    #[tokio::test]
    async fn directory_lifecycle_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let os = binding(allow_tree(temp.path()));

        let nested = temp.path().join("a/b/c");
        os.mkdir_all(&nested).unwrap();
        os.write_file(&nested.join("file.bin"), &[0u8; 64]).unwrap();

        let entries = os.read_dir(&temp.path().join("a/b")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c");
        assert!(entries[0].is_dir);

        let stat = os.stat(&nested.join("file.bin")).unwrap();
        assert_eq!(stat.size, 64);
        assert!(!stat.is_dir);
        assert_eq!(stat.name, "file.bin");

        os.truncate(&nested.join("file.bin"), 16).unwrap();
        assert_eq!(os.stat(&nested.join("file.bin")).unwrap().size, 16);

        let renamed = nested.join("renamed.bin");
        os.rename(&nested.join("file.bin"), &renamed).unwrap();
        os.remove(&renamed).unwrap();

        os.remove_all(&temp.path().join("a")).unwrap();
        assert!(!temp.path().join("a").exists());
        // Removing a missing path again is fine.
        os.remove_all(&temp.path().join("a/b")).unwrap();
    }

    #[tokio::test]
    async fn library_dirs_follow_the_configured_roots() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = AppContext::new();
        ctx.set_modules_partial(AppContextModules {
            anime_library_paths: Some(vec![temp.path().to_path_buf()]),
            ..Default::default()
        });

        let os = binding_with_ctx(
            SystemAllowlist {
                allow_read_paths: vec![
                    "$SEANIME_ANIME_LIBRARY".into(),
                    "$SEANIME_ANIME_LIBRARY/**".into(),
                ],
                ..Default::default()
            },
            ctx.clone(),
        );
        assert_eq!(os.library_dirs().unwrap(), vec![temp.path().to_path_buf()]);

        // A library root outside the allowlist is an error, not a gap.
        let other = tempfile::tempdir().unwrap();
        ctx.set_modules_partial(AppContextModules {
            anime_library_paths: Some(vec![other.path().to_path_buf()]),
            ..Default::default()
        });
        assert!(matches!(
            binding_with_ctx(SystemAllowlist::default(), ctx).library_dirs(),
            Err(HostError::PathNotAuthorized { .. })
        ));
    }

    #[tokio::test]
    async fn cmd_requires_an_allowlist_scope() {
        let os = binding(SystemAllowlist::default());
        let denied = os.cmd("echo", &["hi".into()]);
        assert!(matches!(denied, Err(HostError::PermissionDenied(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cmd_output_captures_stdout() {
        let os = binding(SystemAllowlist {
            command_scopes: vec![CommandScope {
                description: None,
                command: "echo".into(),
                args: vec![CommandArg {
                    value: None,
                    validator: Some("$ARGS".into()),
                }],
            }],
            ..Default::default()
        });

        let cmd = os.cmd("echo", &["hello".into()]).unwrap();
        let output = cmd.output().unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn streamed_cmd_delivers_lines_then_exit() {
        let os = binding(SystemAllowlist {
            command_scopes: vec![CommandScope {
                description: None,
                command: "sh".into(),
                args: vec![
                    CommandArg {
                        value: Some("-c".into()),
                        validator: None,
                    },
                    CommandArg {
                        value: None,
                        validator: Some("$ARGS".into()),
                    },
                ],
            }],
            ..Default::default()
        });

        let script = "printf 'one\\ntwo\\n'; printf 'err\\n' >&2".to_string();
        let cmd = os.cmd("sh", &["-c".into(), script]).unwrap();

        let events: Arc<Mutex<Vec<CmdEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        cmd.run(move |event| sink.lock().push(event)).unwrap();

        // The exit event is queued after every line event.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if events
                .lock()
                .iter()
                .any(|e| matches!(e, CmdEvent::Exit { .. }))
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "command timed out");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let events = events.lock();
        let stdout: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CmdEvent::Stdout(line) => Some(line.clone()),
                _ => None,
            })
            .collect();
        let stderr: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CmdEvent::Stderr(line) => Some(line.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
        assert_eq!(stderr, vec!["err"]);
        assert!(matches!(
            events.last(),
            Some(CmdEvent::Exit { code: 0, .. })
        ));
    }
}
