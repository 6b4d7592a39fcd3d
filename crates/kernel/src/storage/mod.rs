//! Per-extension persistent key-value storage.
//!
//! Each extension owns one JSON document persisted as a single row in the
//! `plugin_data` table. Keys use dot notation to address nested values
//! (`a.b.c` is the `c` child of `b` child of `a`). A hot cache keeps the
//! parsed document and recently read keys; watchers get notified when a
//! key or any of its descendants changes.
//!
//! Callers serialize access through the extension's scheduler, so
//! operations do not need to guard against concurrent mutation of the
//! same document.

use std::sync::atomic::{AtomicU64, Ordering};

use moka::sync::Cache;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::db::Database;
use crate::state::AppContext;

/// Bound on pending notifications per watcher. When a watcher's channel
/// is full, new notifications for it are dropped.
const WATCH_CHANNEL_CAPACITY: usize = 100;

/// Upper bound on cached individual-key entries.
const KEY_CACHE_CAPACITY: u64 = 1000;

/// Errors from persistent storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The application has not opened its database yet.
    #[error("database is not initialized")]
    DatabaseNotInitialized,

    /// The underlying query failed.
    #[error("storage query failed: {0}")]
    Database(#[from] rusqlite::Error),

    /// The stored document could not be parsed or serialized.
    #[error("stored document is not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct StorageWatcher {
    id: u64,
    key: String,
    tx: mpsc::Sender<Value>,
}

/// Handle for receiving change notifications on a watched key.
///
/// Dropping the subscription detaches the watcher on the next delivery
/// attempt; [`PluginStorage::stop_watching`] detaches it eagerly.
#[derive(Debug)]
pub struct StorageSubscription {
    id: u64,
    rx: mpsc::Receiver<Value>,
}

impl StorageSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next notification, waiting if none is pending.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Receive the next notification without waiting.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

/// Persistent key-value storage scoped to one extension.
pub struct PluginStorage {
    ctx: AppContext,
    extension_id: String,
    document_cache: Cache<String, Map<String, Value>>,
    key_cache: Cache<String, Value>,
    watchers: Mutex<Vec<StorageWatcher>>,
    next_watch_id: AtomicU64,
}

impl PluginStorage {
    pub fn new(ctx: AppContext, extension_id: impl Into<String>) -> Self {
        Self {
            ctx,
            extension_id: extension_id.into(),
            document_cache: Cache::new(1),
            key_cache: Cache::new(KEY_CACHE_CAPACITY),
            watchers: Mutex::new(Vec::new()),
            next_watch_id: AtomicU64::new(1),
        }
    }

    /// Get the value at `key`, or `None` when the path does not exist.
    pub fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        if let Some(cached) = self.key_cache.get(key) {
            return Ok(Some(cached));
        }

        let document = self.load_document(true)?.unwrap_or_default();
        let value = get_nested(&document, key).cloned();

        if let Some(value) = &value {
            if !value.is_null() {
                self.key_cache.insert(key.to_string(), value.clone());
            }
        }

        Ok(value)
    }

    /// Set the value at `key`, creating intermediate objects as needed.
    pub fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        trace!(extension = %self.extension_id, %key, "storage set");

        let mut document = self.load_document(true)?.unwrap_or_default();
        set_nested(&mut document, key, value.clone());
        self.save_document(&document)?;

        self.key_cache.insert(key.to_string(), value);
        self.notify_path(&document, key);
        Ok(())
    }

    /// Whether the path exists, including paths holding an explicit null.
    pub fn has(&self, key: &str) -> Result<bool, StorageError> {
        if self.key_cache.contains_key(key) {
            return Ok(true);
        }

        let Some(document) = self.load_document(false)? else {
            return Ok(false);
        };

        match get_nested(&document, key) {
            Some(value) => {
                if !value.is_null() {
                    self.key_cache.insert(key.to_string(), value.clone());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All keys in the document as dot paths, parents before children.
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let Some(document) = self.load_document(false)? else {
            return Ok(Vec::new());
        };

        let mut keys = Vec::new();
        collect_keys(&document, "", &mut keys);
        Ok(keys)
    }

    /// Remove the value at `key`. Removing a missing path is not an error.
    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        trace!(extension = %self.extension_id, %key, "storage remove");

        let Some(mut document) = self.load_document(false)? else {
            return Ok(());
        };

        if delete_nested(&mut document, key) {
            self.save_document(&document)?;
            self.notify_path(&document, key);
        }
        Ok(())
    }

    /// Reset the document to an empty object.
    pub fn clear(&self) -> Result<(), StorageError> {
        trace!(extension = %self.extension_id, "storage clear");

        let document = Map::new();
        // Touch the row first so clearing also materializes the document.
        self.load_document(true)?;
        self.save_document(&document)?;
        self.notify_all(&document);
        Ok(())
    }

    /// Delete the extension's row entirely. Watchers remain attached and
    /// observe a now-empty document.
    pub fn drop_data(&self) -> Result<(), StorageError> {
        trace!(extension = %self.extension_id, "storage drop");

        self.database()?.delete_plugin_data(&self.extension_id)?;
        self.document_cache.invalidate_all();
        self.key_cache.invalidate_all();
        self.notify_all(&Map::new());
        Ok(())
    }

    /// Watch a key for changes.
    ///
    /// The subscriber is notified when the key or any of its descendants
    /// is mutated, with the current value at the watched path (null after
    /// a removal). The current value is delivered immediately on
    /// subscription.
    pub fn watch(&self, key: &str) -> Result<StorageSubscription, StorageError> {
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

        let initial = self
            .load_document(false)?
            .as_ref()
            .and_then(|document| get_nested(document, key).cloned())
            .unwrap_or(Value::Null);
        // The channel is empty, so this cannot fail with Full.
        let _ = tx.try_send(initial);

        self.watchers.lock().push(StorageWatcher {
            id,
            key: key.to_string(),
            tx,
        });

        Ok(StorageSubscription { id, rx })
    }

    /// Detach a watcher by subscription id.
    pub fn stop_watching(&self, id: u64) {
        self.watchers.lock().retain(|w| w.id != id);
    }

    fn database(&self) -> Result<Database, StorageError> {
        self.ctx
            .database()
            .ok_or(StorageError::DatabaseNotInitialized)
    }

    /// Load the parsed document, consulting the cache first. With
    /// `create_if_missing` an empty row is materialized when none exists;
    /// otherwise a missing row yields `None`.
    fn load_document(
        &self,
        create_if_missing: bool,
    ) -> Result<Option<Map<String, Value>>, StorageError> {
        if let Some(document) = self.document_cache.get(&self.extension_id) {
            return Ok(Some(document));
        }

        let db = self.database()?;
        match db.get_plugin_data(&self.extension_id)? {
            Some(bytes) => {
                let document: Map<String, Value> = serde_json::from_slice(&bytes)?;
                self.document_cache
                    .insert(self.extension_id.clone(), document.clone());
                Ok(Some(document))
            }
            None if create_if_missing => {
                let document = Map::new();
                db.put_plugin_data(&self.extension_id, b"{}")?;
                self.document_cache
                    .insert(self.extension_id.clone(), document.clone());
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }

    /// Persist the document. Individual-key cache entries are dropped
    /// wholesale; the parsed-document cache is refreshed in place.
    fn save_document(&self, document: &Map<String, Value>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(document)?;
        self.database()?
            .put_plugin_data(&self.extension_id, &bytes)?;

        self.key_cache.invalidate_all();
        self.document_cache
            .insert(self.extension_id.clone(), document.clone());
        Ok(())
    }

    /// Notify watchers of `mutated` and of every ancestor path, each with
    /// the current value at its own watched depth.
    fn notify_path(&self, document: &Map<String, Value>, mutated: &str) {
        self.notify_where(document, |watched| covers(watched, mutated));
    }

    fn notify_all(&self, document: &Map<String, Value>) {
        self.notify_where(document, |_| true);
    }

    fn notify_where(&self, document: &Map<String, Value>, affected: impl Fn(&str) -> bool) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|watcher| {
            if !affected(&watcher.key) {
                return true;
            }
            let value = get_nested(document, &watcher.key)
                .cloned()
                .unwrap_or(Value::Null);
            match watcher.tx.try_send(value) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        extension = %self.extension_id,
                        key = %watcher.key,
                        "storage watcher is not keeping up, dropping notification"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

impl std::fmt::Debug for PluginStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginStorage")
            .field("extension_id", &self.extension_id)
            .finish_non_exhaustive()
    }
}

/// Whether a watcher on `watched` covers a mutation of `mutated`:
/// the same path, or `watched` is an ancestor of `mutated`.
fn covers(watched: &str, mutated: &str) -> bool {
    mutated
        .strip_prefix(watched)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

fn get_nested<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = data.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Set a dot-path value, creating intermediate objects as needed. A
/// non-object value sitting on an intermediate path is replaced.
fn set_nested(data: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = data;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry.as_object_mut() {
            Some(next) => current = next,
            // Unreachable after the object coercion above.
            None => return,
        }
    }
}

fn delete_nested(data: &mut Map<String, Value>, path: &str) -> bool {
    match path.split_once('.') {
        None => data.remove(path).is_some(),
        Some((first, rest)) => match data.get_mut(first).and_then(Value::as_object_mut) {
            Some(next) => delete_nested(next, rest),
            None => false,
        },
    }
}

/// Collect every dot path in the document, parents before children.
fn collect_keys(data: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in data {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        out.push(full.clone());
        if let Some(nested) = value.as_object() {
            collect_keys(nested, &full, out);
        }
    }
}
