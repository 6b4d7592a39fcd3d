//! Hook registry and dispatcher.
//!
//! Listeners for an event run in registration order. A listener that
//! fails is logged and skipped; the remaining listeners still run.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::events::HookEvent;
use crate::scheduler::Scheduler;

type ListenerFn = Arc<dyn Fn(&mut HookEnvelope) -> anyhow::Result<()> + Send + Sync>;

/// The payload handed to each listener.
///
/// `data` is the serialized event; listeners mutate it in place.
/// `prevent_default` asks the host to skip its default behavior once
/// dispatch completes.
#[derive(Clone)]
pub struct HookEnvelope {
    name: &'static str,
    pub data: Value,
    default_prevented: bool,
}

impl HookEnvelope {
    /// Event name this envelope belongs to.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented
    }
}

impl fmt::Debug for HookEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEnvelope")
            .field("name", &self.name)
            .field("default_prevented", &self.default_prevented)
            .finish_non_exhaustive()
    }
}

/// Outcome of dispatching a typed event.
#[derive(Debug)]
pub struct Dispatched<E> {
    /// The event after listeners ran, mutations included.
    pub event: E,
    /// Whether any listener asked to suppress the default behavior.
    pub default_prevented: bool,
}

#[derive(Clone)]
struct RegisteredListener {
    extension_id: String,
    scheduler: Scheduler,
    callback: ListenerFn,
}

/// Process-wide hook registry keyed by event name.
///
/// Cloning is cheap; all clones share one registry.
#[derive(Clone, Default)]
pub struct HookManager {
    listeners: Arc<RwLock<HashMap<&'static str, Vec<RegisteredListener>>>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for a named event.
    ///
    /// The callback runs on `scheduler`'s worker thread so it may touch
    /// engine-owned state. Listeners fire in the order they were
    /// registered, across all extensions.
    pub fn subscribe(
        &self,
        event: &'static str,
        extension_id: impl Into<String>,
        scheduler: Scheduler,
        callback: impl Fn(&mut HookEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        let listener = RegisteredListener {
            extension_id: extension_id.into(),
            scheduler,
            callback: Arc::new(callback),
        };
        self.listeners
            .write()
            .entry(event)
            .or_default()
            .push(listener);
    }

    /// Drop every listener the given extension registered. Called when
    /// the extension unloads.
    pub fn remove_extension(&self, extension_id: &str) {
        let mut map = self.listeners.write();
        for listeners in map.values_mut() {
            listeners.retain(|l| l.extension_id != extension_id);
        }
        map.retain(|_, listeners| !listeners.is_empty());
    }

    pub fn has_listeners(&self, event: &str) -> bool {
        self.listener_count(event) > 0
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .get(event)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Fire an event and block until every listener has run.
    ///
    /// Listener mutations are folded back into the returned event. Must
    /// not be called from an async context; dispatch from Tokio tasks
    /// via `spawn_blocking`.
    pub fn trigger<E: HookEvent>(&self, event: E) -> Dispatched<E> {
        let data = match serde_json::to_value(&event) {
            Ok(data) => data,
            Err(e) => {
                error!(event = E::NAME, error = %e, "hook payload failed to serialize");
                return Dispatched {
                    event,
                    default_prevented: false,
                };
            }
        };

        let envelope = self.dispatch(E::NAME, data);
        let default_prevented = envelope.default_prevented;
        match serde_json::from_value(envelope.data) {
            Ok(mutated) => Dispatched {
                event: mutated,
                default_prevented,
            },
            Err(e) => {
                // A listener reshaped the payload into something the
                // host cannot read back; keep the pre-dispatch event.
                error!(event = E::NAME, error = %e, "hook payload mutated into an unreadable shape");
                Dispatched {
                    event,
                    default_prevented,
                }
            }
        }
    }

    fn dispatch(&self, name: &'static str, data: Value) -> HookEnvelope {
        // Snapshot so a listener may subscribe or unsubscribe without
        // deadlocking against this dispatch.
        let snapshot: Vec<RegisteredListener> = self
            .listeners
            .read()
            .get(name)
            .map(|l| l.to_vec())
            .unwrap_or_default();

        let envelope = Arc::new(Mutex::new(HookEnvelope {
            name,
            data,
            default_prevented: false,
        }));

        if snapshot.is_empty() {
            debug!(event = name, "no hook listeners registered");
        }

        for listener in snapshot {
            let envelope = Arc::clone(&envelope);
            let callback = Arc::clone(&listener.callback);
            let ext = listener.extension_id.clone();
            let outcome = listener.scheduler.schedule(move || {
                let mut guard = envelope.lock();
                if let Err(e) = callback(&mut guard) {
                    error!(ext = %ext, event = name, error = %e, "hook listener failed");
                }
                Ok(())
            });
            if let Err(e) = outcome {
                warn!(
                    ext = %listener.extension_id,
                    event = name,
                    error = %e,
                    "hook listener skipped"
                );
            }
        }

        // Every scheduled job has completed, so the clones are gone.
        match Arc::try_unwrap(envelope) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => shared.lock().clone(),
        }
    }
}

impl fmt::Debug for HookManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookManager")
            .field("events", &self.listeners.read().len())
            .finish()
    }
}
