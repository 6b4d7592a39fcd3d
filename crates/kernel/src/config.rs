//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Host configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding host data (default: ./data).
    pub data_dir: PathBuf,

    /// Path to the SQLite database file (default: {data_dir}/ayame.db).
    pub database_path: PathBuf,

    /// Directory scanned for extension manifests (default: ./extensions).
    pub extensions_dir: PathBuf,

    /// Local anime library roots (comma-separated, may be empty).
    pub anime_library_paths: Vec<PathBuf>,

    /// Timezone for cron schedules: "utc" (default) or "local".
    pub cron_timezone: String,

    /// Maximum in-flight fetch requests per extension (default: 50).
    pub fetch_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("ayame.db"));

        let extensions_dir = env::var("EXTENSIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./extensions"));

        let anime_library_paths = env::var("ANIME_LIBRARY_PATHS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let cron_timezone = env::var("CRON_TIMEZONE")
            .unwrap_or_else(|_| "utc".to_string())
            .to_lowercase();
        if cron_timezone != "utc" && cron_timezone != "local" {
            anyhow::bail!("CRON_TIMEZONE must be \"utc\" or \"local\", got {cron_timezone:?}");
        }

        let fetch_concurrency = env::var("FETCH_CONCURRENCY")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .context("FETCH_CONCURRENCY must be a valid usize")?;

        Ok(Self {
            data_dir,
            database_path,
            extensions_dir,
            anime_library_paths,
            cron_timezone,
            fetch_concurrency,
        })
    }
}
