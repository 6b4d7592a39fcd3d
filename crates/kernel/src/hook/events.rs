//! Concrete hook event types.
//!
//! Each event serializes to the JSON payload listeners see. Domain
//! objects the engine owns (entries, collections, file lists) travel as
//! raw [`serde_json::Value`] blobs since their schemas belong to the
//! embedding host, not this crate.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named host event that can be dispatched on the
/// [`HookManager`](super::HookManager).
pub trait HookEvent: Serialize + DeserializeOwned + Send + 'static {
    /// Registry key extensions subscribe to, e.g. `"AnimeEntryRequested"`.
    const NAME: &'static str;
}

/// Fired when the host is about to assemble an anime entry. Prevent
/// default and fill in the payload to replace the host's own lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimeEntryRequestedEvent {
    pub media_id: i64,
    pub local_files: Option<Value>,
    pub anime_collection: Option<Value>,
}

impl HookEvent for AnimeEntryRequestedEvent {
    const NAME: &'static str = "AnimeEntryRequested";
}

/// Fired before filler metadata is merged into an entry. Prevent
/// default to skip the merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimeEntryFillerHydrationEvent {
    pub entry: Option<Value>,
}

impl HookEvent for AnimeEntryFillerHydrationEvent {
    const NAME: &'static str = "AnimeEntryFillerHydration";
}

/// Fired when the missing-episodes view is about to be computed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingEpisodesRequestedEvent {
    pub anime_collection: Option<Value>,
    pub local_files: Option<Value>,
    #[serde(default)]
    pub silenced_media_ids: Vec<i64>,
}

impl HookEvent for MissingEpisodesRequestedEvent {
    const NAME: &'static str = "MissingEpisodesRequested";
}

/// Fired when the library collection view is about to be assembled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimeLibraryCollectionRequestedEvent {
    pub anime_collection: Option<Value>,
    pub local_files: Option<Value>,
}

impl HookEvent for AnimeLibraryCollectionRequestedEvent {
    const NAME: &'static str = "AnimeLibraryCollectionRequested";
}

/// Fired when a local file is requested to play. Prevent default to
/// take over playback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFilePlaybackRequestedEvent {
    pub path: String,
}

impl HookEvent for LocalFilePlaybackRequestedEvent {
    const NAME: &'static str = "LocalFilePlaybackRequested";
}

/// Fired when a library scan begins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStartedEvent {
    pub dir_path: String,
    pub other_dir_paths: Vec<String>,
    pub enhanced: bool,
    pub skip_locked: bool,
    pub skip_ignored: bool,
}

impl HookEvent for ScanStartedEvent {
    const NAME: &'static str = "ScanStarted";
}

/// Fired when a library scan finishes. `duration` is in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanCompletedEvent {
    pub local_files: Option<Value>,
    pub duration: i64,
}

impl HookEvent for ScanCompletedEvent {
    const NAME: &'static str = "ScanCompleted";
}
