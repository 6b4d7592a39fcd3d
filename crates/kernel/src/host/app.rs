//! Host application surface exposed to extensions.
//!
//! Every operation that needs a collaborator looks it up on the
//! [`AppContext`] at call time and fails with
//! [`HostError::Unavailable`](crate::error::HostError::Unavailable)
//! when it has not been wired, so extensions get a clean error instead
//! of a hang when a module is offline.

use serde_json::Value;

use crate::error::{HostError, HostResult};
use crate::state::{AppContext, ClientEvent};

/// The `$app` binding.
#[derive(Debug, Clone)]
pub struct AppBinding {
    ctx: AppContext,
}

impl AppBinding {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub fn version(&self) -> &str {
        self.ctx.version()
    }

    pub fn version_name(&self) -> &str {
        self.ctx.version_name()
    }

    pub fn is_offline(&self) -> bool {
        self.ctx.is_offline()
    }

    /// Ask connected clients to refetch the named queries.
    pub fn invalidate_client_query(&self, keys: Vec<String>) {
        self.ctx
            .send_client_event(ClientEvent::InvalidateQueries(keys));
    }

    /// Refetch the user's anime collection, then run the registered
    /// refresh callback so the application invalidates its caches.
    pub async fn refresh_anime_collection(&self) -> HostResult<()> {
        let anilist = self.ctx.anilist()?;
        if !anilist.is_authenticated() {
            return Err(HostError::NotAuthenticated);
        }
        anilist.refresh_anime_collection().await?;
        if let Some(callback) = self.ctx.on_refresh_anime_collection() {
            callback();
        }
        Ok(())
    }

    /// Refetch the user's manga collection, then run the registered
    /// refresh callback.
    pub async fn refresh_manga_collection(&self) -> HostResult<()> {
        let anilist = self.ctx.anilist()?;
        if !anilist.is_authenticated() {
            return Err(HostError::NotAuthenticated);
        }
        anilist.refresh_manga_collection().await?;
        if let Some(callback) = self.ctx.on_refresh_manga_collection() {
            callback();
        }
        Ok(())
    }

    pub async fn torrents(&self) -> HostResult<Value> {
        Ok(self.ctx.torrent_client()?.list_torrents().await?)
    }

    pub async fn active_torrents(&self) -> HostResult<Value> {
        Ok(self.ctx.torrent_client()?.active_torrents().await?)
    }

    pub async fn add_torrent_magnets(
        &self,
        magnets: Vec<String>,
        destination: String,
    ) -> HostResult<()> {
        Ok(self
            .ctx
            .torrent_client()?
            .add_magnets(magnets, destination)
            .await?)
    }

    pub async fn remove_torrents(&self, hashes: Vec<String>) -> HostResult<()> {
        Ok(self.ctx.torrent_client()?.remove_torrents(hashes).await?)
    }

    pub async fn pause_torrents(&self, hashes: Vec<String>) -> HostResult<()> {
        Ok(self.ctx.torrent_client()?.pause_torrents(hashes).await?)
    }

    pub async fn resume_torrents(&self, hashes: Vec<String>) -> HostResult<()> {
        Ok(self.ctx.torrent_client()?.resume_torrents(hashes).await?)
    }

    pub async fn torrent_files(&self, hash: String) -> HostResult<Value> {
        Ok(self.ctx.torrent_client()?.torrent_files(hash).await?)
    }

    pub fn filler_episodes(&self, media_id: i64) -> HostResult<Vec<String>> {
        Ok(self.ctx.filler_store()?.filler_episodes(media_id)?)
    }

    pub fn set_filler_episodes(&self, media_id: i64, episodes: Vec<String>) -> HostResult<()> {
        Ok(self
            .ctx
            .filler_store()?
            .set_filler_episodes(media_id, episodes)?)
    }

    pub fn remove_filler_data(&self, media_id: i64) -> HostResult<()> {
        Ok(self.ctx.filler_store()?.remove_filler_data(media_id)?)
    }

    /// Whether the episode is marked as filler for the given media.
    pub fn is_episode_filler(&self, media_id: i64, episode_number: i64) -> HostResult<bool> {
        let episodes = self.ctx.filler_store()?.filler_episodes(media_id)?;
        let needle = episode_number.to_string();
        Ok(episodes.iter().any(|episode| episode == &needle))
    }

    /// Nudge the library auto-scanner. Fire-and-forget.
    pub fn notify_auto_scanner(&self) -> HostResult<()> {
        self.ctx.auto_scanner()?.notify();
        Ok(())
    }

    /// Kick off an auto-downloader pass. Fire-and-forget.
    pub fn run_auto_downloader(&self) -> HostResult<()> {
        self.ctx.auto_downloader()?.run();
        Ok(())
    }

    pub fn set_discord_activity(&self, activity: Value) -> HostResult<()> {
        self.ctx.discord_presence()?.set_activity(activity);
        Ok(())
    }

    pub fn clear_discord_activity(&self) -> HostResult<()> {
        self.ctx.discord_presence()?.clear_activity();
        Ok(())
    }

    /// Ask the client to open a URL in the user's external player.
    /// Dropped silently when no client is connected.
    pub fn open_external_player_link(&self, url: String, media_id: i64, episode_number: i64) {
        self.ctx.send_client_event(ClientEvent::ExternalPlayerOpenUrl {
            url,
            media_id,
            episode_number,
        });
    }

    /// Start playback of a local file in the user's media player.
    pub async fn play_local_file(&self, path: String) -> HostResult<()> {
        Ok(self.ctx.playback()?.play_local_file(path).await?)
    }
}
