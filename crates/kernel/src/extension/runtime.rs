//! Per-extension runtime assembly and the host-level extension registry.
//!
//! Each loaded extension gets an [`ExtensionRuntime`]: a dedicated
//! [`Scheduler`] worker owning the script engine, plus the capability
//! objects (store, storage, cron, downloads, fetch, fs, os, archives,
//! app) the embedder wires into that engine. The engine itself is only
//! a contract here: the embedder supplies an [`EngineFactory`], and the
//! produced engine lives in a slot on the worker thread for the
//! extension's lifetime.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::error::ExtensionError;
use super::gate::Gate;
use super::manifest::ExtensionManifest;
use crate::cron::{CronEngine, CronTimezone};
use crate::download::DownloadManager;
use crate::hook::HookManager;
use crate::host::{
    AppBinding, ArchiveBinding, FetchClient, FsBinding, OsBinding, MAX_CONCURRENT_FETCHES,
};
use crate::scheduler::Scheduler;
use crate::state::AppContext;
use crate::storage::PluginStorage;
use crate::store::Store;

const MANIFEST_SUFFIX: &str = ".manifest.json";

/// A loaded extension: its manifest, directory, and entrypoint source.
#[derive(Debug, Clone)]
pub struct Extension {
    pub manifest: Arc<ExtensionManifest>,
    pub dir: PathBuf,
    pub source: String,
}

impl Extension {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }
}

/// The contract an embedded script engine fulfils.
///
/// Implementations are created by the [`EngineFactory`] on the
/// extension's worker thread and never leave it, so they need not be
/// `Send`.
pub trait ScriptEngine {
    /// Evaluate source text. Only ever called on the worker thread.
    fn eval(&mut self, source: &str) -> anyhow::Result<()>;
}

/// Produces one engine per extension, on that extension's worker.
pub type EngineFactory =
    Arc<dyn Fn(&Extension) -> anyhow::Result<Box<dyn ScriptEngine>> + Send + Sync>;

/// Tunables applied to every runtime the host builds.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Timezone cron expressions are evaluated in.
    pub cron_timezone: CronTimezone,
    /// In-flight request cap for each extension's fetch client.
    pub fetch_concurrency: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            cron_timezone: CronTimezone::Utc,
            fetch_concurrency: MAX_CONCURRENT_FETCHES,
        }
    }
}

thread_local! {
    // One slot per worker thread. The engine drops with the thread.
    static ENGINE: RefCell<Option<Box<dyn ScriptEngine>>> = const { RefCell::new(None) };
}

/// Run `f` against the calling worker's engine.
///
/// Returns `None` off the worker thread, before the engine is
/// installed, or on a reentrant call.
pub fn with_engine<R>(f: impl FnOnce(&mut dyn ScriptEngine) -> R) -> Option<R> {
    ENGINE.with(|slot| {
        let mut guard = slot.try_borrow_mut().ok()?;
        let engine = guard.as_mut()?;
        Some(f(engine.as_mut()))
    })
}

fn install_engine(engine: Box<dyn ScriptEngine>) {
    ENGINE.with(|slot| *slot.borrow_mut() = Some(engine));
}

/// Everything one extension runs on: its scheduler, and the capability
/// objects the embedder exposes inside the engine.
pub struct ExtensionRuntime {
    extension: Arc<Extension>,
    scheduler: Scheduler,
    gate: Gate,
    store: Arc<Store<String, Value>>,
    storage: Arc<PluginStorage>,
    cron: CronEngine,
    downloads: DownloadManager,
    fetch: FetchClient,
    hooks: HookManager,
    app: AppBinding,
    fs: FsBinding,
    os: OsBinding,
    archives: ArchiveBinding,
}

impl ExtensionRuntime {
    /// Assemble the runtime for an extension. The engine is not created
    /// yet; call [`Self::boot`] to evaluate the entrypoint.
    pub fn new(
        extension: Extension,
        ctx: AppContext,
        hooks: HookManager,
        handle: Handle,
        options: &RuntimeOptions,
    ) -> Result<Self, ExtensionError> {
        let extension = Arc::new(extension);
        let manifest = Arc::clone(&extension.manifest);
        let id = manifest.id.clone();

        let scheduler =
            Scheduler::new(id.clone()).map_err(|e| ExtensionError::RuntimeStartFailed {
                extension: id.clone(),
                details: e.to_string(),
            })?;
        let log_id = id.clone();
        scheduler.set_on_exception(move |e| {
            error!(ext = %log_id, error = %e, "unhandled extension exception");
        });

        let fetch = FetchClient::with_concurrency(id.clone(), options.fetch_concurrency).map_err(
            |e| ExtensionError::RuntimeStartFailed {
                extension: id.clone(),
                details: e.to_string(),
            },
        )?;

        let gate = Gate::new(ctx.clone());
        let cron = CronEngine::new(
            id.clone(),
            scheduler.clone(),
            handle.clone(),
            options.cron_timezone,
        );
        let downloads = DownloadManager::new(
            id.clone(),
            gate.clone(),
            Arc::clone(&manifest),
            handle.clone(),
        );
        let storage = Arc::new(PluginStorage::new(ctx.clone(), id.clone()));
        let os = OsBinding::new(
            gate.clone(),
            Arc::clone(&manifest),
            ctx.clone(),
            scheduler.clone(),
            handle,
        );
        let fs = FsBinding::new(gate.clone(), Arc::clone(&manifest));
        let archives = ArchiveBinding::new(gate.clone(), Arc::clone(&manifest));
        let app = AppBinding::new(ctx);

        Ok(Self {
            extension,
            scheduler,
            gate,
            store: Arc::new(Store::new()),
            storage,
            cron,
            downloads,
            fetch,
            hooks,
            app,
            fs,
            os,
            archives,
        })
    }

    /// Create the engine and evaluate the entrypoint, synchronously, as
    /// the worker's first job. The engine then stays installed on the
    /// worker for the extension's lifetime.
    ///
    /// Blocks until evaluation finishes; do not call from an async
    /// context.
    pub fn boot(&self, factory: &EngineFactory) -> Result<(), ExtensionError> {
        let extension = Arc::clone(&self.extension);
        let factory = Arc::clone(factory);
        let outcome = self.scheduler.schedule(move || {
            let mut engine = factory(&extension)?;
            engine
                .eval(&extension.source)
                .context("entrypoint evaluation failed")?;
            install_engine(engine);
            Ok(())
        });
        outcome.map_err(|e| ExtensionError::load_failed(self.id(), e))
    }

    pub fn id(&self) -> &str {
        self.extension.id()
    }

    pub fn extension(&self) -> &Extension {
        &self.extension
    }

    pub fn manifest(&self) -> &Arc<ExtensionManifest> {
        &self.extension.manifest
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// The extension's in-memory `$store`.
    pub fn store(&self) -> &Arc<Store<String, Value>> {
        &self.store
    }

    /// The extension's persistent `$storage`.
    pub fn storage(&self) -> &Arc<PluginStorage> {
        &self.storage
    }

    pub fn cron(&self) -> &CronEngine {
        &self.cron
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    pub fn fetch(&self) -> &FetchClient {
        &self.fetch
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    pub fn app(&self) -> &AppBinding {
        &self.app
    }

    pub fn fs(&self) -> &FsBinding {
        &self.fs
    }

    pub fn os(&self) -> &OsBinding {
        &self.os
    }

    pub fn archives(&self) -> &ArchiveBinding {
        &self.archives
    }

    /// Tear the extension down: stop cron, cancel downloads, close
    /// store watchers, drop hook listeners, stop the scheduler. The
    /// engine drops with its worker thread.
    pub fn shutdown(&self) {
        self.cron.stop();
        self.downloads.cancel_all();
        self.store.stop();
        self.hooks.remove_extension(self.id());
        self.scheduler.stop();
    }
}

impl std::fmt::Debug for ExtensionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRuntime")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// Host-level registry: discovers extension directories, builds and
/// boots a runtime per extension, and owns them until unload.
pub struct ExtensionHost {
    ctx: AppContext,
    hooks: HookManager,
    factory: EngineFactory,
    handle: Handle,
    options: RuntimeOptions,
    runtimes: HashMap<String, Arc<ExtensionRuntime>>,
}

impl ExtensionHost {
    pub fn new(ctx: AppContext, factory: EngineFactory, handle: Handle) -> Self {
        Self {
            ctx,
            hooks: HookManager::new(),
            factory,
            handle,
            options: RuntimeOptions::default(),
            runtimes: HashMap::new(),
        }
    }

    /// Replace the tunables applied to runtimes loaded from now on.
    pub fn set_runtime_options(&mut self, options: RuntimeOptions) {
        self.options = options;
    }

    /// The process-wide hook registry shared by all extensions.
    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    /// Load every extension under `extensions_dir`.
    ///
    /// Each extension lives in its own subdirectory. Directories are
    /// visited in name order for a deterministic load sequence; a
    /// directory that fails to load is logged and skipped.
    ///
    /// Blocks while entrypoints evaluate; do not call from an async
    /// context.
    pub fn load_all(&mut self, extensions_dir: &Path) -> anyhow::Result<()> {
        if !extensions_dir.exists() {
            info!(?extensions_dir, "extensions directory does not exist, skipping");
            return Ok(());
        }

        let mut entries: Vec<_> = std::fs::read_dir(extensions_dir)
            .with_context(|| {
                format!(
                    "failed to read extensions directory: {}",
                    extensions_dir.display()
                )
            })?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .collect();

        // Sort for deterministic load order
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let extension_dir = entry.path();
            match self.load_extension(&extension_dir) {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        extension_dir = %extension_dir.display(),
                        error = %e,
                        "failed to load extension, skipping"
                    );
                }
            }
        }

        info!(count = self.runtimes.len(), "loaded extensions");
        Ok(())
    }

    /// Load a single extension from its directory.
    ///
    /// The directory must contain exactly one `<id>.manifest.json`
    /// whose id matches the directory name, plus the entrypoint file
    /// the manifest names.
    pub fn load_extension(&mut self, extension_dir: &Path) -> Result<(), ExtensionError> {
        let dir_name = extension_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let manifest_files: Vec<PathBuf> = std::fs::read_dir(extension_dir)
            .map_err(|e| ExtensionError::load_failed(&dir_name, e))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX))
            })
            .collect();

        let manifest_path = match manifest_files.len() {
            0 => {
                return Err(ExtensionError::missing_manifest(
                    extension_dir.display().to_string(),
                ))
            }
            1 => manifest_files[0].clone(),
            _ => {
                return Err(ExtensionError::MultipleManifests {
                    path: extension_dir.display().to_string(),
                })
            }
        };

        let manifest = ExtensionManifest::parse(&manifest_path)
            .map_err(|e| ExtensionError::invalid_manifest(&dir_name, format!("{e:#}")))?;

        let expected_file = format!("{}{}", manifest.id, MANIFEST_SUFFIX);
        let actual_file = manifest_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if actual_file != expected_file {
            return Err(ExtensionError::invalid_manifest(
                &manifest.id,
                format!("manifest file must be named '{expected_file}', found '{actual_file}'"),
            ));
        }

        if manifest.id != dir_name {
            return Err(ExtensionError::IdMismatch {
                extension: manifest.id,
                directory: dir_name,
            });
        }

        if let Some(existing) = self.runtimes.get(&manifest.id) {
            return Err(ExtensionError::DuplicateId {
                extension: manifest.id.clone(),
                first_path: existing.extension().dir.display().to_string(),
                second_path: extension_dir.display().to_string(),
            });
        }

        let entrypoint_path = extension_dir.join(&manifest.entrypoint);
        if !entrypoint_path.is_file() {
            return Err(ExtensionError::missing_entrypoint(
                &manifest.id,
                entrypoint_path.display().to_string(),
            ));
        }
        let source = std::fs::read_to_string(&entrypoint_path)
            .map_err(|e| ExtensionError::load_failed(&manifest.id, e))?;

        let extension = Extension {
            manifest: Arc::new(manifest),
            dir: extension_dir.to_path_buf(),
            source,
        };
        let id = extension.id().to_string();
        let version = extension.version().to_string();

        let runtime = ExtensionRuntime::new(
            extension,
            self.ctx.clone(),
            self.hooks.clone(),
            self.handle.clone(),
            &self.options,
        )?;

        if let Err(e) = runtime.boot(&self.factory) {
            runtime.shutdown();
            return Err(e);
        }

        debug!(ext = %id, version = %version, "loaded extension");
        self.runtimes.insert(id, Arc::new(runtime));
        Ok(())
    }

    /// Get a loaded extension's runtime by id.
    pub fn get(&self, id: &str) -> Option<Arc<ExtensionRuntime>> {
        self.runtimes.get(id).cloned()
    }

    /// Ids of all loaded extensions, in no particular order.
    pub fn extension_ids(&self) -> Vec<String> {
        self.runtimes.keys().cloned().collect()
    }

    pub fn extension_count(&self) -> usize {
        self.runtimes.len()
    }

    /// Shut down and remove one extension. Returns whether it was
    /// loaded.
    pub fn unload(&mut self, id: &str) -> bool {
        match self.runtimes.remove(id) {
            Some(runtime) => {
                runtime.shutdown();
                info!(ext = %id, "unloaded extension");
                true
            }
            None => false,
        }
    }

    /// Shut down every loaded extension.
    pub fn shutdown_all(&mut self) {
        for (id, runtime) in self.runtimes.drain() {
            runtime.shutdown();
            debug!(ext = %id, "extension shut down");
        }
    }
}

impl std::fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHost")
            .field("extensions", &self.runtimes.len())
            .finish_non_exhaustive()
    }
}
