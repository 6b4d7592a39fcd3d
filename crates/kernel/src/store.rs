//! Concurrent keyed store with change subscriptions.
//!
//! A [`Store`] is a thread-safe `K → V` map shared between extension code
//! (running on a scheduler worker) and host tasks. Mutations can be observed
//! through per-key subscriptions; notification sends never block the writer.
//!
//! One instance backs each extension's `$store` binding, and host components
//! reuse it wherever a watchable map is needed.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Number of removals after which the backing map is rebuilt.
///
/// Removing entries does not return bucket memory; rebuilding into a
/// right-sized map does.
const DELETED_KEY_THRESHOLD: u64 = 200;

/// Per-subscription notification buffer. When a subscriber falls this far
/// behind, newer notifications for it are dropped.
const WATCH_CHANNEL_CAPACITY: usize = 100;

struct Watcher<V> {
    id: u64,
    tx: mpsc::Sender<V>,
}

struct StoreInner<K, V> {
    map: HashMap<K, V>,
    deleted: u64,
    watchers: HashMap<K, Vec<Watcher<V>>>,
}

/// Thread-safe keyed store.
pub struct Store<K, V> {
    inner: RwLock<StoreInner<K, V>>,
    next_watch_id: AtomicU64,
}

/// A live per-key subscription returned by [`Store::watch`].
///
/// Notifications arrive on a bounded channel; when the subscriber lags past
/// the buffer, the newest notifications are dropped rather than blocking the
/// writer. Dropping the subscription (or calling [`Store::stop_watching`])
/// ends it.
pub struct StoreSubscription<V> {
    id: u64,
    rx: mpsc::Receiver<V>,
}

impl<V> StoreSubscription<V> {
    /// Identifier used to cancel this subscription.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next notification. Returns `None` once the subscription
    /// has been cancelled or the store stopped.
    pub async fn recv(&mut self) -> Option<V> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<V, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

impl<K, V> Store<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                map: HashMap::new(),
                deleted: 0,
                watchers: HashMap::new(),
            }),
            next_watch_id: AtomicU64::new(1),
        }
    }

    /// Get a value by key.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().map.get(key).cloned()
    }

    /// Shallow copy of the whole map.
    pub fn get_all(&self) -> HashMap<K, V> {
        self.inner.read().map.clone()
    }

    /// All values, in map order.
    pub fn values(&self) -> Vec<V> {
        self.inner.read().map.values().cloned().collect()
    }

    /// Insert or overwrite a value, notifying the key's subscribers.
    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.write();
        inner.map.insert(key.clone(), value.clone());
        notify(&mut inner.watchers, &key, &value);
    }

    pub fn has(&self, key: &K) -> bool {
        self.inner.read().map.contains_key(key)
    }

    /// Remove a key. Rebuilds the backing map once enough removals have
    /// accumulated.
    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.write();
        if inner.map.remove(key).is_some() {
            inner.deleted += 1;
            if inner.deleted >= DELETED_KEY_THRESHOLD {
                inner.map = std::mem::take(&mut inner.map).into_iter().collect();
                inner.deleted = 0;
            }
        }
    }

    /// Remove every entry.
    pub fn remove_all(&self) {
        let mut inner = self.inner.write();
        inner.map = HashMap::new();
        inner.deleted = 0;
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    /// Get the value for `key`, inserting the produced value when absent.
    /// Subscribers are notified only when an insert happens.
    pub fn get_or_set(&self, key: K, produce: impl FnOnce() -> V) -> V {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.map.get(&key) {
            return existing.clone();
        }
        let value = produce();
        inner.map.insert(key.clone(), value.clone());
        notify(&mut inner.watchers, &key, &value);
        value
    }

    /// Insert `value` under `key` unless doing so would grow the store to
    /// `limit` or beyond. Overwriting an existing key always succeeds.
    /// Returns whether the value was stored.
    pub fn set_if_less_than_limit(&self, key: K, value: V, limit: usize) -> bool {
        let mut inner = self.inner.write();
        if !inner.map.contains_key(&key) && inner.map.len() >= limit {
            return false;
        }
        inner.map.insert(key.clone(), value.clone());
        notify(&mut inner.watchers, &key, &value);
        true
    }

    /// Replace the entire contents. Subscriptions stay attached but are not
    /// notified; the next mutation of their key reaches them as usual.
    pub fn reset(&self, replacement: HashMap<K, V>) {
        let mut inner = self.inner.write();
        inner.map = replacement;
        inner.deleted = 0;
    }

    /// Subscribe to changes of one key.
    pub fn watch(&self, key: K) -> StoreSubscription<V> {
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        self.inner
            .write()
            .watchers
            .entry(key)
            .or_default()
            .push(Watcher { id, tx });
        StoreSubscription { id, rx }
    }

    /// Cancel one subscription, closing its channel.
    pub fn stop_watching(&self, key: &K, id: u64) {
        let mut inner = self.inner.write();
        if let Some(list) = inner.watchers.get_mut(key) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                inner.watchers.remove(key);
            }
        }
    }

    /// Close every subscription channel and drop all subscriptions.
    pub fn stop(&self) {
        self.inner.write().watchers.clear();
    }
}

impl<K, V> Store<K, V>
where
    K: Eq + Hash + Clone + Serialize,
    V: Clone + Serialize,
{
    /// Serialize the map to a JSON object string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.inner.read().map)
    }
}

impl<K, V> Store<K, V>
where
    K: Eq + Hash + Clone + DeserializeOwned,
    V: Clone + DeserializeOwned,
{
    /// Merge entries from a JSON object string, notifying subscribers of
    /// every key present in the document.
    pub fn load_json(&self, json: &str) -> serde_json::Result<()> {
        let parsed: HashMap<K, V> = serde_json::from_str(json)?;
        let mut inner = self.inner.write();
        for (key, value) in parsed {
            inner.map.insert(key.clone(), value.clone());
            notify(&mut inner.watchers, &key, &value);
        }
        Ok(())
    }
}

impl<K, V> Default for Store<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Send `value` to every subscriber of `key` without blocking. Subscribers
/// that have lagged past their buffer miss this notification; subscribers
/// whose receiving side is gone are pruned.
fn notify<K, V>(watchers: &mut HashMap<K, Vec<Watcher<V>>>, key: &K, value: &V)
where
    K: Eq + Hash,
    V: Clone,
{
    let Some(list) = watchers.get_mut(key) else {
        return;
    };
    list.retain(|watcher| match watcher.tx.try_send(value.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!("store subscriber lagging; dropping notification");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    });
    if list.is_empty() {
        watchers.remove(key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let store: Store<String, i64> = Store::new();
        assert!(store.is_empty());

        store.set("a".into(), 1);
        store.set("b".into(), 2);
        assert_eq!(store.get(&"a".into()), Some(1));
        assert_eq!(store.get(&"missing".into()), None);
        assert!(store.has(&"b".into()));
        assert_eq!(store.len(), 2);

        let mut values = store.values();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2]);

        store.remove(&"a".into());
        assert!(!store.has(&"a".into()));

        store.remove_all();
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_or_set_produces_once() {
        let store: Store<String, i64> = Store::new();
        assert_eq!(store.get_or_set("k".into(), || 7), 7);
        // Existing value wins; the producer is not consulted.
        assert_eq!(store.get_or_set("k".into(), || 9), 7);
    }

    #[test]
    fn test_set_if_less_than_limit() {
        let store: Store<String, i64> = Store::new();
        assert!(store.set_if_less_than_limit("a".into(), 1, 2));
        assert!(store.set_if_less_than_limit("b".into(), 2, 2));
        // Full: new keys are refused.
        assert!(!store.set_if_less_than_limit("c".into(), 3, 2));
        // Existing keys are always overwritable.
        assert!(store.set_if_less_than_limit("a".into(), 10, 2));
        assert_eq!(store.get(&"a".into()), Some(10));
    }

    #[test]
    fn test_removals_trigger_rebuild() {
        let store: Store<u64, u64> = Store::new();
        for i in 0..500 {
            store.set(i, i);
        }
        for i in 0..250 {
            store.remove(&i);
        }
        // Contents survive the internal rebuild.
        assert_eq!(store.len(), 250);
        assert_eq!(store.get(&499), Some(499));
        assert_eq!(store.get(&10), None);
    }

    #[test]
    fn test_watch_receives_set_and_get_or_set() {
        let store: Store<String, i64> = Store::new();
        let mut sub = store.watch("k".into());

        store.set("k".into(), 1);
        store.set("other".into(), 99);
        store.get_or_set("k".into(), || 2); // hit, no notification
        store.remove(&"k".into());
        store.get_or_set("k".into(), || 3); // insert, notified

        assert_eq!(sub.try_recv().unwrap(), 1);
        assert_eq!(sub.try_recv().unwrap(), 3);
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn test_watch_overflow_drops_newest() {
        let store: Store<String, i64> = Store::new();
        let mut sub = store.watch("k".into());

        for i in 0..(WATCH_CHANNEL_CAPACITY as i64 + 20) {
            store.set("k".into(), i);
        }

        let mut received = Vec::new();
        while let Ok(v) = sub.try_recv() {
            received.push(v);
        }
        // Oldest notifications survive; the overflow was dropped.
        assert_eq!(received.len(), WATCH_CHANNEL_CAPACITY);
        assert_eq!(received[0], 0);
        assert_eq!(received[WATCH_CHANNEL_CAPACITY - 1], WATCH_CHANNEL_CAPACITY as i64 - 1);
    }

    #[test]
    fn test_stop_watching_closes_channel() {
        let store: Store<String, i64> = Store::new();
        let mut sub = store.watch("k".into());
        store.stop_watching(&"k".into(), sub.id());
        store.set("k".into(), 1);
        assert!(matches!(
            sub.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_stop_closes_every_subscriber() {
        let store: Store<String, i64> = Store::new();
        let mut a = store.watch("a".into());
        let mut b = store.watch("b".into());
        store.stop();
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
    }

    #[test]
    fn test_json_roundtrip_notifies() {
        let store: Store<String, i64> = Store::new();
        store.set("a".into(), 1);
        let json = store.to_json().unwrap();

        let restored: Store<String, i64> = Store::new();
        let mut sub = restored.watch("a".into());
        restored.load_json(&json).unwrap();
        assert_eq!(restored.get(&"a".into()), Some(1));
        assert_eq!(sub.try_recv().unwrap(), 1);
    }
}
