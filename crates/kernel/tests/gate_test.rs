//! Integration tests for the permission gate and the gated OS binding.
//!
//! ## Test Coverage
//!
//! - Path allowlists: concrete patterns, placeholder and environment
//!   variable expansion, read/write separation
//! - Command scopes: literal values, $ARGS, $PATH, and regex validators
//! - OsBinding end-to-end: gated file I/O and subprocess streaming

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ayame_kernel::error::HostError;
use ayame_kernel::extension::{ExtensionManifest, Gate, PathMode};
use ayame_kernel::host::{CmdEvent, OsBinding};
use ayame_kernel::scheduler::Scheduler;
use ayame_kernel::state::AppContextModules;
use ayame_test_utils::{test_context, test_manifest, wait_until, ManifestBuilder};
use parking_lot::Mutex;
use serde_json::json;
use tokio::runtime::Runtime;

fn parse(builder: &ManifestBuilder) -> Arc<ExtensionManifest> {
    let json = builder.build().to_string();
    Arc::new(ExtensionManifest::parse_str(&json, Path::new("test.manifest.json")).unwrap())
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

#[test]
fn reads_and_writes_follow_their_own_allowlists() {
    let gate = Gate::new(test_context());
    let dir = tempfile::tempdir().unwrap();
    let readable = dir.path().join("in/notes.txt");
    std::fs::create_dir_all(readable.parent().unwrap()).unwrap();
    std::fs::write(&readable, b"hi").unwrap();

    let manifest = parse(
        &test_manifest("scoped")
            .with_scope("system")
            .allow_read(&format!("{}/in/**", dir.path().display()))
            .allow_write(&format!("{}/out/**", dir.path().display())),
    );

    assert!(gate.is_allowed_path(&manifest, &readable, PathMode::Read));
    assert!(!gate.is_allowed_path(&manifest, &readable, PathMode::Write));

    let writable = dir.path().join("out/result.txt");
    assert!(gate.is_allowed_path(&manifest, &writable, PathMode::Write));
    assert!(!gate.is_allowed_path(&manifest, &writable, PathMode::Read));

    let outside = dir.path().join("elsewhere.txt");
    assert!(!gate.is_allowed_path(&manifest, &outside, PathMode::Read));
}

#[test]
fn missing_system_scope_denies_everything() {
    let gate = Gate::new(test_context());
    let dir = tempfile::tempdir().unwrap();
    // Allowlist present but the "system" scope is not declared.
    let manifest = parse(
        &test_manifest("unscoped")
            .allow_read(&format!("{}/**", dir.path().display()))
            .allow_command("echo", json!([{ "validator": "$ARGS" }])),
    );

    assert!(!gate.is_allowed_path(&manifest, &dir.path().join("x"), PathMode::Read));
    assert!(!gate.is_allowed_command(&manifest, "echo", &args(&["hello"])));
}

#[test]
fn temp_placeholder_expands_to_the_system_temp_dir() {
    let gate = Gate::new(test_context());
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("episode.mkv");
    std::fs::write(&file, b"x").unwrap();

    let manifest = parse(
        &test_manifest("temp-user")
            .with_scope("system")
            .allow_read("$TEMP/**"),
    );

    assert!(gate.is_allowed_path(&manifest, &file, PathMode::Read));
    assert!(!gate.is_allowed_path(&manifest, Path::new("/etc/passwd"), PathMode::Read));
}

#[test]
fn environment_variables_expand_in_patterns() {
    let gate = Gate::new(test_context());
    let dir = tempfile::tempdir().unwrap();
    unsafe { std::env::set_var("AYAME_GATE_TEST_ROOT", dir.path()) };

    let manifest = parse(
        &test_manifest("env-user")
            .with_scope("system")
            .allow_read("$AYAME_GATE_TEST_ROOT/**"),
    );

    assert!(gate.is_allowed_path(&manifest, &dir.path().join("any/file.txt"), PathMode::Read));
}

#[test]
fn library_placeholder_uses_the_context_paths() {
    let ctx = test_context();
    let lib = tempfile::tempdir().unwrap();
    ctx.set_modules_partial(AppContextModules {
        anime_library_paths: Some(vec![lib.path().to_path_buf()]),
        ..AppContextModules::default()
    });
    let gate = Gate::new(ctx);

    let manifest = parse(
        &test_manifest("library-reader")
            .with_scope("system")
            .allow_read("$SEANIME_ANIME_LIBRARY/**"),
    );

    assert!(gate.is_allowed_path(&manifest, &lib.path().join("Show/ep1.mkv"), PathMode::Read));
    assert!(!gate.is_allowed_path(&manifest, Path::new("/somewhere/else.mkv"), PathMode::Read));
}

#[test]
fn command_scopes_validate_each_argument() {
    let gate = Gate::new(test_context());
    let manifest = parse(
        &test_manifest("commander")
            .with_scope("system")
            .allow_command("open", json!([{ "validator": "^https?://.*$" }]))
            .allow_command("kill", json!([{ "validator": "[0-9]+" }]))
            .allow_command(
                "ffprobe",
                json!([{ "value": "-v" }, { "value": "quiet" }, { "validator": "$ARGS" }]),
            ),
    );

    assert!(gate.is_allowed_command(&manifest, "open", &args(&["https://example.com"])));
    assert!(!gate.is_allowed_command(&manifest, "open", &args(&["file:///etc/passwd"])));

    // The regex must cover the whole argument, not just a prefix.
    assert!(gate.is_allowed_command(&manifest, "kill", &args(&["123"])));
    assert!(!gate.is_allowed_command(&manifest, "kill", &args(&["123; reboot"])));

    assert!(gate.is_allowed_command(&manifest, "ffprobe", &args(&["-v", "quiet", "file.mkv"])));
    // Literal arguments must match exactly and in position.
    assert!(!gate.is_allowed_command(&manifest, "ffprobe", &args(&["-v", "loud", "file.mkv"])));
    // More arguments than declared are refused.
    assert!(!gate.is_allowed_command(&manifest, "ffprobe", &args(&["-v", "quiet", "a", "b"])));
    // Fewer arguments than declared are refused too.
    assert!(!gate.is_allowed_command(&manifest, "ffprobe", &args(&["-v"])));
    // Unlisted programs are always refused.
    assert!(!gate.is_allowed_command(&manifest, "rm", &args(&["-rf", "/"])));
}

#[test]
fn the_path_validator_requires_an_existing_writable_path() {
    let gate = Gate::new(test_context());
    let dir = tempfile::tempdir().unwrap();
    let existing = dir.path().join("archive.zip");
    std::fs::write(&existing, b"zip").unwrap();

    let manifest = parse(
        &test_manifest("mover")
            .with_scope("system")
            .allow_write(&format!("{}/**", dir.path().display()))
            .allow_command("touch", json!([{ "validator": "$PATH" }])),
    );

    assert!(gate.is_allowed_command(&manifest, "touch", &[existing.display().to_string()]));

    // The path must exist.
    let missing = dir.path().join("ghost.zip");
    assert!(!gate.is_allowed_command(&manifest, "touch", &[missing.display().to_string()]));

    // Existing but outside the write allowlist.
    let other = tempfile::tempdir().unwrap();
    let foreign = other.path().join("foreign.txt");
    std::fs::write(&foreign, b"x").unwrap();
    assert!(!gate.is_allowed_command(&manifest, "touch", &[foreign.display().to_string()]));
}

#[test]
fn gated_file_io_round_trips() {
    let rt = Runtime::new().unwrap();
    let scheduler = Scheduler::new("gate-io-test").unwrap();
    let dir = tempfile::tempdir().unwrap();
    let manifest = parse(
        &test_manifest("io")
            .with_scope("system")
            .allow_read(&format!("{}/**", dir.path().display()))
            .allow_write(&format!("{}/**", dir.path().display())),
    );
    let ctx = test_context();
    let os = OsBinding::new(
        Gate::new(ctx.clone()),
        manifest,
        ctx,
        scheduler.clone(),
        rt.handle().clone(),
    );

    let file = dir.path().join("data.bin");
    os.write_file(&file, b"payload").unwrap();
    assert_eq!(os.read_file(&file).unwrap(), b"payload");

    let err = os.read_file(Path::new("/etc/hostname")).unwrap_err();
    assert!(matches!(err, HostError::PathNotAuthorized { .. }));

    // Unlisted commands never produce a handle.
    assert!(os.cmd("rm", &args(&["-rf"])).is_err());

    scheduler.stop();
}

#[test]
fn commands_stream_their_output_onto_the_worker() {
    let rt = Runtime::new().unwrap();
    let scheduler = Scheduler::new("cmd-test").unwrap();
    let manifest = parse(
        &test_manifest("streamer")
            .with_scope("system")
            .allow_command("echo", json!([{ "validator": "$ARGS" }])),
    );
    let ctx = test_context();
    let os = OsBinding::new(
        Gate::new(ctx.clone()),
        manifest,
        ctx,
        scheduler.clone(),
        rt.handle().clone(),
    );

    let cmd = os.cmd("echo", &args(&["streamed"])).unwrap();
    let events: Arc<Mutex<Vec<CmdEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let worker_only = Arc::new(Mutex::new(true));
    let worker_flag = Arc::clone(&worker_only);
    let probe = scheduler.clone();
    let _handle = cmd
        .run(move |event| {
            if !probe.on_worker_thread() {
                *worker_flag.lock() = false;
            }
            sink.lock().push(event);
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, CmdEvent::Exit { .. }))
    }));

    let events = events.lock();
    assert!(events
        .iter()
        .any(|e| matches!(e, CmdEvent::Stdout(line) if line == "streamed")));
    assert!(events.iter().any(|e| matches!(e, CmdEvent::Exit { code: 0, .. })));
    assert!(*worker_only.lock());

    drop(events);
    scheduler.stop();
}
