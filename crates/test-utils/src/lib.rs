//! Ayame test utilities.
//!
//! Helpers for integration testing: manifest builders, extension
//! fixtures on disk, stub script engines, and assertion utilities.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};

use ayame_kernel::db::Database;
use ayame_kernel::extension::{EngineFactory, Extension, ScriptEngine};
use ayame_kernel::state::AppContextModules;
use ayame_kernel::AppContext;

/// Create a manifest builder with default values for `id`.
pub fn test_manifest(id: &str) -> ManifestBuilder {
    ManifestBuilder {
        id: id.to_string(),
        name: id.to_string(),
        version: "1.0.0".to_string(),
        entrypoint: format!("{id}.js"),
        scopes: vec![],
        allow_read_paths: vec![],
        allow_write_paths: vec![],
        command_scopes: vec![],
    }
}

/// A manifest builder for creating extension fixtures.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    pub id: String,
    pub name: String,
    pub version: String,
    pub entrypoint: String,
    pub scopes: Vec<String>,
    pub allow_read_paths: Vec<String>,
    pub allow_write_paths: Vec<String>,
    pub command_scopes: Vec<JsonValue>,
}

impl ManifestBuilder {
    /// Set a custom version.
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Set a custom entrypoint file name.
    pub fn with_entrypoint(mut self, entrypoint: &str) -> Self {
        self.entrypoint = entrypoint.to_string();
        self
    }

    /// Declare a permission scope ("system", "storage", "cron", ...).
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.scopes.push(scope.to_string());
        self
    }

    /// Allow reads under a glob pattern.
    pub fn allow_read(mut self, pattern: &str) -> Self {
        self.allow_read_paths.push(pattern.to_string());
        self
    }

    /// Allow writes under a glob pattern.
    pub fn allow_write(mut self, pattern: &str) -> Self {
        self.allow_write_paths.push(pattern.to_string());
        self
    }

    /// Allow a command with the given argument constraints, e.g.
    /// `json!([{ "value": "-o" }, { "validator": "$ARGS" }])`.
    pub fn allow_command(mut self, command: &str, args: JsonValue) -> Self {
        self.command_scopes.push(json!({
            "command": command,
            "args": args,
        }));
        self
    }

    /// Render the manifest as JSON.
    pub fn build(&self) -> JsonValue {
        json!({
            "id": self.id,
            "name": self.name,
            "version": self.version,
            "entrypoint": self.entrypoint,
            "permissions": {
                "scopes": self.scopes,
                "systemAllowlist": {
                    "allowReadPaths": self.allow_read_paths,
                    "allowWritePaths": self.allow_write_paths,
                    "commandScopes": self.command_scopes,
                }
            }
        })
    }
}

/// Materialize an extension directory under `root`: the manifest file
/// plus an entrypoint holding `source`. Returns the extension directory.
pub fn write_extension(root: &Path, manifest: &JsonValue, source: &str) -> PathBuf {
    let id = manifest["id"].as_str().expect("manifest has an id");
    let entrypoint = manifest["entrypoint"]
        .as_str()
        .expect("manifest has an entrypoint");

    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(format!("{id}.manifest.json")),
        serde_json::to_string_pretty(manifest).unwrap(),
    )
    .unwrap();
    std::fs::write(dir.join(entrypoint), source).unwrap();
    dir
}

/// An [`AppContext`] with an in-memory database wired in.
pub fn test_context() -> AppContext {
    let ctx = AppContext::new();
    ctx.set_modules_partial(AppContextModules {
        database: Some(Database::open_in_memory().unwrap()),
        ..AppContextModules::default()
    });
    ctx
}

/// Shared log of sources evaluated by [`RecordingEngine`] instances.
pub type EvalLog = Arc<Mutex<Vec<String>>>;

/// Script engine that records every source it evaluates.
pub struct RecordingEngine {
    log: EvalLog,
}

impl ScriptEngine for RecordingEngine {
    fn eval(&mut self, source: &str) -> anyhow::Result<()> {
        self.log.lock().push(source.to_owned());
        Ok(())
    }
}

/// Factory producing [`RecordingEngine`]s, plus the log they append to.
pub fn recording_factory() -> (EngineFactory, EvalLog) {
    let log: EvalLog = Arc::new(Mutex::new(Vec::new()));
    let factory_log = Arc::clone(&log);
    let factory: EngineFactory = Arc::new(move |_ext: &Extension| {
        Ok(Box::new(RecordingEngine {
            log: Arc::clone(&factory_log),
        }) as Box<dyn ScriptEngine>)
    });
    (factory, log)
}

struct NoopEngine;

impl ScriptEngine for NoopEngine {
    fn eval(&mut self, _source: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Factory producing engines that accept any source.
pub fn noop_factory() -> EngineFactory {
    Arc::new(|_ext: &Extension| Ok(Box::new(NoopEngine) as Box<dyn ScriptEngine>))
}

struct FailingEngine {
    message: &'static str,
}

impl ScriptEngine for FailingEngine {
    fn eval(&mut self, _source: &str) -> anyhow::Result<()> {
        anyhow::bail!("{}", self.message)
    }
}

/// Factory producing engines whose every evaluation fails with `message`.
pub fn failing_factory(message: &'static str) -> EngineFactory {
    Arc::new(move |_ext: &Extension| {
        Ok(Box::new(FailingEngine { message }) as Box<dyn ScriptEngine>)
    })
}

/// Drain everything currently buffered on a watcher channel.
pub fn drain<T>(rx: &mut tokio::sync::mpsc::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
/// Returns whether the condition held.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Assertion helpers for JSON documents.
pub mod assert {
    use serde_json::Value;

    /// Assert that a JSON document has a value at a dot-notation path.
    pub fn has_dotted(value: &Value, path: &str) {
        let mut current = value;
        for segment in path.split('.') {
            current = match current.get(segment) {
                Some(v) => v,
                None => panic!("expected JSON to have '{path}' (missing '{segment}'): {value}"),
            };
        }
    }

    /// Assert that two JSON values are equal, with a readable diff.
    pub fn json_eq(actual: &Value, expected: &Value) {
        assert_eq!(
            actual,
            expected,
            "JSON mismatch:\nactual: {}\nexpected: {}",
            serde_json::to_string_pretty(actual).unwrap(),
            serde_json::to_string_pretty(expected).unwrap()
        );
    }

    /// Assert that a string contains a substring.
    pub fn contains(haystack: &str, needle: &str) {
        assert!(
            haystack.contains(needle),
            "expected string to contain '{needle}'\nactual: {haystack}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_builder_produces_parseable_json() {
        let manifest = test_manifest("my-extension")
            .with_version("2.1.0")
            .with_scope("system")
            .with_scope("storage")
            .allow_read("$TEMP/**/*")
            .allow_command("echo", json!([{ "validator": "$ARGS" }]))
            .build();

        assert_eq!(manifest["id"], "my-extension");
        assert_eq!(manifest["version"], "2.1.0");
        assert_eq!(manifest["permissions"]["scopes"][1], "storage");
        assert_eq!(
            manifest["permissions"]["systemAllowlist"]["commandScopes"][0]["command"],
            "echo"
        );
    }

    #[test]
    fn write_extension_lays_out_the_directory() {
        let root = tempfile::tempdir().unwrap();
        let manifest = test_manifest("on-disk").build();
        let dir = write_extension(root.path(), &manifest, "// entry\n");

        assert!(dir.join("on-disk.manifest.json").is_file());
        assert_eq!(
            std::fs::read_to_string(dir.join("on-disk.js")).unwrap(),
            "// entry\n"
        );
    }

    #[test]
    fn recording_factory_logs_evaluations() {
        let (factory, log) = recording_factory();
        let manifest = test_manifest("recorded").build();
        let root = tempfile::tempdir().unwrap();
        let dir = write_extension(root.path(), &manifest, "console.log(1);");

        let parsed = ayame_kernel::extension::ExtensionManifest::parse(
            &dir.join("recorded.manifest.json"),
        )
        .unwrap();
        let extension = Extension {
            manifest: Arc::new(parsed),
            dir,
            source: "console.log(1);".to_string(),
        };
        let mut engine = factory(&extension).unwrap();
        engine.eval(&extension.source).unwrap();

        assert_eq!(*log.lock(), vec!["console.log(1);".to_string()]);
    }

    #[test]
    fn wait_until_sees_immediate_conditions() {
        assert!(wait_until(Duration::from_millis(50), || true));
        assert!(!wait_until(Duration::from_millis(50), || false));
    }

    #[test]
    fn dotted_assertions() {
        let doc = json!({"settings": {"theme": {"color": "red"}}});
        assert::has_dotted(&doc, "settings.theme.color");
        assert::json_eq(&doc["settings"]["theme"], &json!({"color": "red"}));
        assert::contains("hello world", "world");
    }
}
