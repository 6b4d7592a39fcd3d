//! Host context shared with the plugin runtime.
//!
//! The kernel never talks to catalog clients, torrent clients, or the player
//! directly. The embedding application hands it an [`AppContext`] carrying
//! whichever collaborators are currently available; every binding that needs
//! one checks for its presence and fails with [`HostError::Unavailable`]
//! otherwise. Collaborators can be wired (or replaced) at any point during
//! the process lifetime via [`AppContext::set_modules_partial`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::db::Database;
use crate::error::{HostError, HostResult};

/// Callback invoked after a remote collection refresh so the embedding
/// application can invalidate its own caches.
pub type RefreshCallback = Arc<dyn Fn() + Send + Sync>;

/// Events the kernel sends to the embedding application, typically forwarded
/// to connected clients over WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Ask clients to refetch the named queries.
    InvalidateQueries(Vec<String>),

    /// Show an error toast.
    ErrorToast(String),

    /// Open a URL in the user's configured external player.
    ExternalPlayerOpenUrl {
        url: String,
        media_id: i64,
        episode_number: i64,
    },
}

/// Remote catalog platform (AniList).
#[async_trait]
pub trait AnilistPlatform: Send + Sync {
    /// Whether an account token is configured.
    fn is_authenticated(&self) -> bool;

    /// Refetch the user's anime collection from the remote service.
    async fn refresh_anime_collection(&self) -> anyhow::Result<()>;

    /// Refetch the user's manga collection from the remote service.
    async fn refresh_manga_collection(&self) -> anyhow::Result<()>;
}

/// Active torrent client (qBittorrent, Transmission, ...).
///
/// Payloads are passed through as JSON documents; their shape belongs to the
/// embedding application.
#[async_trait]
pub trait TorrentClient: Send + Sync {
    async fn list_torrents(&self) -> anyhow::Result<serde_json::Value>;
    async fn active_torrents(&self) -> anyhow::Result<serde_json::Value>;
    async fn add_magnets(&self, magnets: Vec<String>, destination: String) -> anyhow::Result<()>;
    async fn remove_torrents(&self, hashes: Vec<String>) -> anyhow::Result<()>;
    async fn pause_torrents(&self, hashes: Vec<String>) -> anyhow::Result<()>;
    async fn resume_torrents(&self, hashes: Vec<String>) -> anyhow::Result<()>;
    async fn torrent_files(&self, hash: String) -> anyhow::Result<serde_json::Value>;
}

/// Filler episode metadata cache.
pub trait FillerStore: Send + Sync {
    fn filler_episodes(&self, media_id: i64) -> anyhow::Result<Vec<String>>;
    fn set_filler_episodes(&self, media_id: i64, episodes: Vec<String>) -> anyhow::Result<()>;
    fn remove_filler_data(&self, media_id: i64) -> anyhow::Result<()>;
}

/// Library auto-scanner. Notification is fire-and-forget.
pub trait AutoScanner: Send + Sync {
    fn notify(&self);
}

/// Episode auto-downloader. Running a pass is fire-and-forget.
pub trait AutoDownloader: Send + Sync {
    fn run(&self);
}

/// Discord rich presence.
pub trait DiscordPresence: Send + Sync {
    fn set_activity(&self, activity: serde_json::Value);
    fn clear_activity(&self);
}

/// Media playback controller.
#[async_trait]
pub trait PlaybackController: Send + Sync {
    /// Start playback of a local file in the user's media player.
    async fn play_local_file(&self, path: String) -> anyhow::Result<()>;
}

/// Collaborators to wire into an [`AppContext`].
///
/// Only the fields that are `Some` are applied; everything else keeps its
/// current value. This lets the embedding application wire modules up in
/// whatever order they come online.
#[derive(Default)]
pub struct AppContextModules {
    pub database: Option<Database>,
    pub anime_library_paths: Option<Vec<PathBuf>>,
    pub client_events: Option<mpsc::UnboundedSender<ClientEvent>>,
    pub anilist: Option<Arc<dyn AnilistPlatform>>,
    pub torrent_client: Option<Arc<dyn TorrentClient>>,
    pub filler_store: Option<Arc<dyn FillerStore>>,
    pub auto_scanner: Option<Arc<dyn AutoScanner>>,
    pub auto_downloader: Option<Arc<dyn AutoDownloader>>,
    pub discord_presence: Option<Arc<dyn DiscordPresence>>,
    pub playback: Option<Arc<dyn PlaybackController>>,
    pub on_refresh_anime_collection: Option<RefreshCallback>,
    pub on_refresh_manga_collection: Option<RefreshCallback>,
    pub is_offline: Option<bool>,
}

/// Shared host context.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<AppContextInner>,
}

struct AppContextInner {
    /// Application version reported to extensions.
    version: String,

    /// Human-readable release name reported to extensions.
    version_name: String,

    /// Embedded database. Absent until the application opens it; persistent
    /// storage operations fail cleanly meanwhile.
    database: RwLock<Option<Database>>,

    /// Local anime library roots, used by the permission gate's
    /// `$SEANIME_ANIME_LIBRARY` placeholder.
    anime_library_paths: RwLock<Vec<PathBuf>>,

    /// Sink for events destined for connected clients.
    client_events: RwLock<Option<mpsc::UnboundedSender<ClientEvent>>>,

    /// Remote catalog platform.
    anilist: RwLock<Option<Arc<dyn AnilistPlatform>>>,

    /// Torrent client adapter.
    torrent_client: RwLock<Option<Arc<dyn TorrentClient>>>,

    /// Filler metadata cache.
    filler_store: RwLock<Option<Arc<dyn FillerStore>>>,

    /// Library auto-scanner.
    auto_scanner: RwLock<Option<Arc<dyn AutoScanner>>>,

    /// Episode auto-downloader.
    auto_downloader: RwLock<Option<Arc<dyn AutoDownloader>>>,

    /// Discord rich presence.
    discord_presence: RwLock<Option<Arc<dyn DiscordPresence>>>,

    /// Media playback controller.
    playback: RwLock<Option<Arc<dyn PlaybackController>>>,

    /// Invoked after an anime collection refresh.
    on_refresh_anime_collection: RwLock<Option<RefreshCallback>>,

    /// Invoked after a manga collection refresh.
    on_refresh_manga_collection: RwLock<Option<RefreshCallback>>,

    /// Whether the application is running without network access.
    is_offline: AtomicBool,
}

impl AppContext {
    /// Create an empty context. Collaborators are wired afterwards via
    /// [`set_modules_partial`](Self::set_modules_partial).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AppContextInner {
                version: env!("CARGO_PKG_VERSION").to_string(),
                version_name: "Ayame".to_string(),
                database: RwLock::new(None),
                anime_library_paths: RwLock::new(Vec::new()),
                client_events: RwLock::new(None),
                anilist: RwLock::new(None),
                torrent_client: RwLock::new(None),
                filler_store: RwLock::new(None),
                auto_scanner: RwLock::new(None),
                auto_downloader: RwLock::new(None),
                discord_presence: RwLock::new(None),
                playback: RwLock::new(None),
                on_refresh_anime_collection: RwLock::new(None),
                on_refresh_manga_collection: RwLock::new(None),
                is_offline: AtomicBool::new(false),
            }),
        }
    }

    /// Wire collaborators into the context. Fields left as `None` keep their
    /// current value.
    pub fn set_modules_partial(&self, modules: AppContextModules) {
        if let Some(database) = modules.database {
            *self.inner.database.write() = Some(database);
        }
        if let Some(paths) = modules.anime_library_paths {
            *self.inner.anime_library_paths.write() = paths;
        }
        if let Some(sink) = modules.client_events {
            *self.inner.client_events.write() = Some(sink);
        }
        if let Some(anilist) = modules.anilist {
            *self.inner.anilist.write() = Some(anilist);
        }
        if let Some(client) = modules.torrent_client {
            *self.inner.torrent_client.write() = Some(client);
        }
        if let Some(filler) = modules.filler_store {
            *self.inner.filler_store.write() = Some(filler);
        }
        if let Some(scanner) = modules.auto_scanner {
            *self.inner.auto_scanner.write() = Some(scanner);
        }
        if let Some(downloader) = modules.auto_downloader {
            *self.inner.auto_downloader.write() = Some(downloader);
        }
        if let Some(presence) = modules.discord_presence {
            *self.inner.discord_presence.write() = Some(presence);
        }
        if let Some(playback) = modules.playback {
            *self.inner.playback.write() = Some(playback);
        }
        if let Some(cb) = modules.on_refresh_anime_collection {
            *self.inner.on_refresh_anime_collection.write() = Some(cb);
        }
        if let Some(cb) = modules.on_refresh_manga_collection {
            *self.inner.on_refresh_manga_collection.write() = Some(cb);
        }
        if let Some(offline) = modules.is_offline {
            self.inner.is_offline.store(offline, Ordering::Relaxed);
        }
    }

    /// Application version, e.g. `"0.1.0-devel"`.
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// Release name, e.g. `"Ayame"`.
    pub fn version_name(&self) -> &str {
        &self.inner.version_name
    }

    /// Get the database handle, if one has been opened.
    pub fn database(&self) -> Option<Database> {
        self.inner.database.read().clone()
    }

    /// Snapshot of the configured anime library roots.
    pub fn anime_library_paths(&self) -> Vec<PathBuf> {
        self.inner.anime_library_paths.read().clone()
    }

    /// Send an event to connected clients. Dropped with a trace when no sink
    /// is attached or the receiving side has gone away.
    pub fn send_client_event(&self, event: ClientEvent) {
        let sink = self.inner.client_events.read().clone();
        match sink {
            Some(sink) => {
                if sink.send(event).is_err() {
                    tracing::debug!("client event receiver dropped; discarding event");
                }
            }
            None => tracing::debug!("no client event sink attached; discarding event"),
        }
    }

    pub fn anilist(&self) -> HostResult<Arc<dyn AnilistPlatform>> {
        self.inner
            .anilist
            .read()
            .clone()
            .ok_or(HostError::Unavailable("AniList platform"))
    }

    pub fn torrent_client(&self) -> HostResult<Arc<dyn TorrentClient>> {
        self.inner
            .torrent_client
            .read()
            .clone()
            .ok_or(HostError::Unavailable("torrent client"))
    }

    pub fn filler_store(&self) -> HostResult<Arc<dyn FillerStore>> {
        self.inner
            .filler_store
            .read()
            .clone()
            .ok_or(HostError::Unavailable("filler store"))
    }

    pub fn auto_scanner(&self) -> HostResult<Arc<dyn AutoScanner>> {
        self.inner
            .auto_scanner
            .read()
            .clone()
            .ok_or(HostError::Unavailable("auto scanner"))
    }

    pub fn auto_downloader(&self) -> HostResult<Arc<dyn AutoDownloader>> {
        self.inner
            .auto_downloader
            .read()
            .clone()
            .ok_or(HostError::Unavailable("auto downloader"))
    }

    pub fn discord_presence(&self) -> HostResult<Arc<dyn DiscordPresence>> {
        self.inner
            .discord_presence
            .read()
            .clone()
            .ok_or(HostError::Unavailable("Discord presence"))
    }

    pub fn playback(&self) -> HostResult<Arc<dyn PlaybackController>> {
        self.inner
            .playback
            .read()
            .clone()
            .ok_or(HostError::Unavailable("playback controller"))
    }

    /// Callback to run after an anime collection refresh, if registered.
    pub fn on_refresh_anime_collection(&self) -> Option<RefreshCallback> {
        self.inner.on_refresh_anime_collection.read().clone()
    }

    /// Callback to run after a manga collection refresh, if registered.
    pub fn on_refresh_manga_collection(&self) -> Option<RefreshCallback> {
        self.inner.on_refresh_manga_collection.read().clone()
    }

    /// Whether the application is running without network access.
    pub fn is_offline(&self) -> bool {
        self.inner.is_offline.load(Ordering::Relaxed)
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("version", &self.inner.version)
            .field("is_offline", &self.is_offline())
            .finish_non_exhaustive()
    }
}
