//! Background file downloads for extensions.
//!
//! Downloads run as tokio tasks writing to gate-approved destinations.
//! Progress snapshots live in the manager for the lifetime of the
//! extension; watchers receive a snapshot about once per second plus a
//! single final snapshot (with zeroed speed) when a download reaches a
//! terminal state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::HostResult;
use crate::extension::{ExtensionManifest, Gate, PathMode};

/// How often transfer speed is recomputed.
const SPEED_WINDOW: Duration = Duration::from_millis(500);

/// How often watchers receive a snapshot.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on snapshots buffered per watcher. Periodic snapshots are
/// dropped when the watcher lags; the final snapshot always waits for
/// room.
const WATCH_CHANNEL_CAPACITY: usize = 8;

/// Lifecycle state of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Cancelled,
    Error,
}

/// Point-in-time snapshot of one download.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub id: String,
    pub url: String,
    pub destination: PathBuf,
    pub total_bytes: u64,
    /// Size reported by the server, when known.
    pub total_size: Option<u64>,
    /// Bytes per second over the last speed window.
    pub speed: u64,
    pub percentage: f64,
    pub status: DownloadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_update: DateTime<Utc>,
    pub start_time: DateTime<Utc>,

    #[serde(skip)]
    last_bytes: u64,
}

impl DownloadProgress {
    pub fn is_finished(&self) -> bool {
        !matches!(self.status, DownloadStatus::Downloading)
    }
}

/// Options accepted by [`DownloadManager::download`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOptions {
    /// Extra request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Total timeout in seconds. A download that exceeds it terminates
    /// in cancelled state.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Handle for receiving progress snapshots of one download.
#[derive(Debug)]
pub struct DownloadSubscription {
    rx: mpsc::Receiver<DownloadProgress>,
}

impl DownloadSubscription {
    /// Receive the next snapshot, waiting if none is pending. Returns
    /// `None` once the final snapshot has been consumed.
    pub async fn recv(&mut self) -> Option<DownloadProgress> {
        self.rx.recv().await
    }

    /// Receive the next snapshot without waiting.
    pub fn try_recv(&mut self) -> Option<DownloadProgress> {
        self.rx.try_recv().ok()
    }

    /// Stop watching. Equivalent to dropping the subscription.
    pub fn cancel(self) {}
}

enum DownloadFailure {
    Cancelled,
    Failed(String),
}

struct DownloadManagerInner {
    extension_id: String,
    gate: Gate,
    manifest: Arc<ExtensionManifest>,
    client: reqwest::Client,
    handle: Handle,
    downloads: DashMap<String, DownloadProgress>,
    cancels: DashMap<String, CancellationToken>,
    // Cancelled when the download reaches a terminal state; watchers
    // key their final fire off this.
    completions: DashMap<String, CancellationToken>,
    // One watcher per id. Re-watching cancels the entry here.
    watchers: DashMap<String, CancellationToken>,
}

/// Per-extension download manager.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<DownloadManagerInner>,
}

impl DownloadManager {
    pub fn new(
        extension_id: impl Into<String>,
        gate: Gate,
        manifest: Arc<ExtensionManifest>,
        handle: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(DownloadManagerInner {
                extension_id: extension_id.into(),
                gate,
                manifest,
                client: reqwest::Client::new(),
                handle,
                downloads: DashMap::new(),
                cancels: DashMap::new(),
                completions: DashMap::new(),
                watchers: DashMap::new(),
            }),
        }
    }

    /// Start a download and return its id.
    ///
    /// The destination must pass the write-path gate; its parent
    /// directory is created if missing.
    pub fn download(
        &self,
        url: &str,
        destination: &Path,
        options: DownloadOptions,
    ) -> HostResult<String> {
        self.inner
            .gate
            .check_path(&self.inner.manifest, destination, PathMode::Write)?;

        let id = Uuid::now_v7().to_string();
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        trace!(
            extension = %self.inner.extension_id,
            %url,
            destination = %destination.display(),
            download_id = %id,
            "starting download"
        );

        let now = Utc::now();
        self.inner.downloads.insert(
            id.clone(),
            DownloadProgress {
                id: id.clone(),
                url: url.to_string(),
                destination: destination.to_path_buf(),
                total_bytes: 0,
                total_size: None,
                speed: 0,
                percentage: 0.0,
                status: DownloadStatus::Downloading,
                error: None,
                last_update: now,
                start_time: now,
                last_bytes: 0,
            },
        );
        self.inner.cancels.insert(id.clone(), cancel.clone());
        self.inner.completions.insert(id.clone(), done.clone());

        let inner = Arc::clone(&self.inner);
        let task_id = id.clone();
        let url = url.to_string();
        let destination = destination.to_path_buf();
        self.inner.handle.spawn(async move {
            inner
                .run_download(task_id, url, destination, options, cancel, done)
                .await;
        });

        Ok(id)
    }

    /// Snapshot of one download, if known.
    pub fn get_progress(&self, id: &str) -> Option<DownloadProgress> {
        self.inner.downloads.get(id).map(|entry| entry.clone())
    }

    /// Snapshots of every download this manager has seen.
    pub fn list_downloads(&self) -> Vec<DownloadProgress> {
        self.inner
            .downloads
            .iter()
            .map(|entry| entry.clone())
            .collect()
    }

    /// Cancel a download. The transfer aborts at the next chunk
    /// boundary; the partial file stays on disk.
    pub fn cancel(&self, id: &str) {
        if let Some(token) = self.inner.cancels.get(id) {
            trace!(extension = %self.inner.extension_id, download_id = %id, "cancelling download");
            token.cancel();
        }
    }

    /// Cancel every in-flight download.
    pub fn cancel_all(&self) {
        trace!(extension = %self.inner.extension_id, "cancelling all downloads");
        for entry in self.inner.cancels.iter() {
            entry.value().cancel();
        }
    }

    /// Watch a download's progress.
    ///
    /// A snapshot is delivered about once per second while the download
    /// runs, then one final snapshot with zeroed speed when it reaches a
    /// terminal state. An id has at most one watcher: re-watching closes
    /// the prior subscription without a final snapshot. Watching an
    /// unknown id yields a subscription that closes without delivering
    /// anything.
    pub fn watch(&self, id: &str) -> DownloadSubscription {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        let replaced = CancellationToken::new();
        if let Some(prior) = self
            .inner
            .watchers
            .insert(id.to_string(), replaced.clone())
        {
            prior.cancel();
        }

        let done = self.inner.completions.get(id).map(|entry| entry.clone());
        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        self.inner.handle.spawn(async move {
            let Some(done) = done else { return };
            let mut ticker = tokio::time::interval(WATCH_INTERVAL);
            // The immediate first tick; reporting starts one interval in.
            ticker.tick().await;

            loop {
                tokio::select! {
                    // Replacement wins over a simultaneous completion.
                    biased;
                    () = replaced.cancelled() => return,
                    () = done.cancelled() => {
                        send_final(&inner, &id, &tx).await;
                        return;
                    }
                    _ = ticker.tick() => {
                        let Some(progress) = inner.downloads.get(&id).map(|e| e.clone()) else {
                            return;
                        };
                        if progress.is_finished() {
                            send_final(&inner, &id, &tx).await;
                            return;
                        }
                        // Drop the snapshot when the watcher lags.
                        let _ = tx.try_send(progress);
                    }
                    () = tx.closed() => return,
                }
            }
        });

        DownloadSubscription { rx }
    }
}

/// Deliver the terminal snapshot with its speed zeroed.
async fn send_final(
    inner: &DownloadManagerInner,
    id: &str,
    tx: &mpsc::Sender<DownloadProgress>,
) {
    if let Some(mut progress) = inner.downloads.get(id).map(|e| e.clone()) {
        progress.speed = 0;
        let _ = tx.send(progress).await;
    }
}

impl DownloadManagerInner {
    async fn run_download(
        self: Arc<Self>,
        id: String,
        url: String,
        destination: PathBuf,
        options: DownloadOptions,
        cancel: CancellationToken,
        done: CancellationToken,
    ) {
        let deadline = options
            .timeout
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

        let outcome = self
            .transfer(&id, &url, &destination, options, &cancel, deadline)
            .await;

        self.with_progress(&id, |progress| match &outcome {
            Ok(()) => {
                progress.status = DownloadStatus::Completed;
            }
            Err(DownloadFailure::Cancelled) => {
                progress.status = DownloadStatus::Cancelled;
            }
            Err(DownloadFailure::Failed(message)) => {
                progress.status = DownloadStatus::Error;
                progress.error = Some(message.clone());
            }
        });

        match &outcome {
            Ok(()) => {
                trace!(extension = %self.extension_id, download_id = %id, "download completed");
            }
            Err(DownloadFailure::Cancelled) => {
                trace!(extension = %self.extension_id, download_id = %id, "download cancelled");
            }
            Err(DownloadFailure::Failed(message)) => {
                warn!(extension = %self.extension_id, download_id = %id, error = %message, "download failed");
            }
        }

        self.cancels.remove(&id);
        done.cancel();
    }

    async fn transfer(
        &self,
        id: &str,
        url: &str,
        destination: &Path,
        options: DownloadOptions,
        cancel: &CancellationToken,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<(), DownloadFailure> {
        let mut request = self.client.get(url);
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }

        let response = tokio::select! {
            () = interrupted(cancel, deadline) => return Err(DownloadFailure::Cancelled),
            result = request.send() => {
                result.map_err(|error| DownloadFailure::Failed(error.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadFailure::Failed(format!(
                "server returned status code {}",
                status.as_u16()
            )));
        }

        let total_size = response.content_length();
        self.with_progress(id, |progress| progress.total_size = total_size);

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| DownloadFailure::Failed(error.to_string()))?;
        }
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|error| DownloadFailure::Failed(error.to_string()))?;

        let mut stream = response.bytes_stream();
        let mut window_start = tokio::time::Instant::now();

        loop {
            let chunk = tokio::select! {
                () = interrupted(cancel, deadline) => return Err(DownloadFailure::Cancelled),
                chunk = stream.next() => match chunk {
                    None => break,
                    Some(Ok(chunk)) => chunk,
                    Some(Err(error)) => return Err(DownloadFailure::Failed(error.to_string())),
                },
            };

            file.write_all(&chunk)
                .await
                .map_err(|error| DownloadFailure::Failed(error.to_string()))?;

            let elapsed = window_start.elapsed();
            let window_closed = elapsed > SPEED_WINDOW;
            self.with_progress(id, |progress| {
                progress.total_bytes += chunk.len() as u64;
                if let Some(size) = progress.total_size {
                    if size > 0 {
                        progress.percentage =
                            progress.total_bytes as f64 / size as f64 * 100.0;
                    }
                }
                if window_closed {
                    let bytes_in_window = progress.total_bytes - progress.last_bytes;
                    progress.speed =
                        (bytes_in_window as f64 / elapsed.as_secs_f64()) as u64;
                    progress.last_bytes = progress.total_bytes;
                    progress.last_update = Utc::now();
                }
            });
            if window_closed {
                window_start = tokio::time::Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|error| DownloadFailure::Failed(error.to_string()))?;
        Ok(())
    }

    fn with_progress(&self, id: &str, f: impl FnOnce(&mut DownloadProgress)) {
        if let Some(mut entry) = self.downloads.get_mut(id) {
            f(&mut entry);
        }
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("extension_id", &self.inner.extension_id)
            .field("downloads", &self.inner.downloads.len())
            .finish_non_exhaustive()
    }
}

/// Resolves when the download is cancelled or its deadline passes.
async fn interrupted(cancel: &CancellationToken, deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep_until(at) => {}
        },
        None => cancel.cancelled().await,
    }
}
