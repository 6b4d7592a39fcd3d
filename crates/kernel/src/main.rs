//! Ayame Kernel
//!
//! Extension runtime host and core services.
//!
//! Runs the kernel standalone: loads configuration, opens the plugin
//! database, discovers extensions under the configured directory, and
//! keeps their runtimes alive until interrupted. Deployments that embed
//! a real script engine build an [`ExtensionHost`] with their own
//! [`EngineFactory`]; this binary installs a no-op engine so discovery,
//! manifests, permissions, cron, and storage all run without one.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use ayame_kernel::cron::CronTimezone;
use ayame_kernel::db::Database;
use ayame_kernel::extension::{
    EngineFactory, Extension, ExtensionHost, RuntimeOptions, ScriptEngine,
};
use ayame_kernel::state::AppContextModules;
use ayame_kernel::{AppContext, Config};

/// Stand-in engine for the standalone daemon. Evaluation is a no-op.
struct NullEngine {
    extension_id: String,
}

impl ScriptEngine for NullEngine {
    fn eval(&mut self, source: &str) -> Result<()> {
        debug!(
            ext = %self.extension_id,
            bytes = source.len(),
            "no engine embedded, entrypoint not evaluated"
        );
        Ok(())
    }
}

fn null_engine_factory() -> EngineFactory {
    Arc::new(|extension: &Extension| {
        Ok(Box::new(NullEngine {
            extension_id: extension.id().to_owned(),
        }) as Box<dyn ScriptEngine>)
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    init_tracing();

    info!("Starting Ayame kernel");

    // Load configuration from environment
    let config = Config::from_env().context("failed to load configuration")?;
    info!(extensions_dir = %config.extensions_dir.display(), "Configuration loaded");

    let database = Database::open(&config.database_path)
        .context("failed to open the plugin database")?;
    info!(path = %config.database_path.display(), "Database ready");

    // Client events would normally fan out to connected WebSocket
    // sessions; the standalone daemon just logs them.
    let (client_events, mut client_event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = client_event_rx.recv().await {
            debug!(?event, "client event");
        }
    });

    let ctx = AppContext::new();
    ctx.set_modules_partial(AppContextModules {
        database: Some(database),
        anime_library_paths: Some(config.anime_library_paths.clone()),
        client_events: Some(client_events),
        ..AppContextModules::default()
    });

    let mut host = ExtensionHost::new(ctx, null_engine_factory(), Handle::current());
    host.set_runtime_options(RuntimeOptions {
        cron_timezone: CronTimezone::parse(&config.cron_timezone).unwrap_or_default(),
        fetch_concurrency: config.fetch_concurrency,
    });

    // Entrypoint evaluation blocks on each extension's worker, so load
    // off the async runtime.
    let extensions_dir = config.extensions_dir.clone();
    let mut host = tokio::task::spawn_blocking(move || -> Result<ExtensionHost> {
        host.load_all(&extensions_dir)?;
        Ok(host)
    })
    .await
    .context("extension loading task panicked")??;

    info!(
        extensions = host.extension_count(),
        "Ayame kernel is running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");

    // Stopping a runtime joins its worker thread, another blocking hop.
    tokio::task::spawn_blocking(move || host.shutdown_all())
        .await
        .context("shutdown task panicked")?;

    info!("Ayame kernel stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ayame_kernel=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
