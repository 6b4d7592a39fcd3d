//! Cooperative cancellation shared between extension code and the
//! bindings that honor it.
//!
//! An [`AbortContext`] owns the abort side; its [`AbortSignal`] handles
//! are passed to long-running operations. Aborting is idempotent: the
//! first call freezes the reason, wakes waiters, and dispatches every
//! registered listener exactly once on the scheduler worker. Listeners
//! added after the abort are dispatched asynchronously as well, also
//! exactly once.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::scheduler::Scheduler;

const DEFAULT_REASON: &str = "cancelled";

type Listener = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    token: CancellationToken,
    state: Mutex<State>,
    scheduler: Scheduler,
}

#[derive(Default)]
struct State {
    /// `Some` once aborted; the reason never changes afterwards.
    reason: Option<String>,
    listeners: Vec<Listener>,
}

/// The owning side of an abort pair.
pub struct AbortContext {
    shared: Arc<Shared>,
}

impl AbortContext {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            shared: Arc::new(Shared {
                token: CancellationToken::new(),
                state: Mutex::new(State::default()),
                scheduler,
            }),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Abort with the given reason, defaulting to `"cancelled"`.
    ///
    /// Only the first call has any effect. Pending listeners are
    /// dispatched to the scheduler worker in registration order.
    pub fn abort(&self, reason: Option<String>) {
        let listeners = {
            let mut state = self.shared.state.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason.unwrap_or_else(|| DEFAULT_REASON.to_owned()));
            self.shared.token.cancel();
            std::mem::take(&mut state.listeners)
        };
        for listener in listeners {
            self.shared.scheduler.schedule_async(move || {
                listener();
                Ok(())
            });
        }
    }
}

impl fmt::Debug for AbortContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortContext")
            .field("aborted", &self.shared.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A handle observing an [`AbortContext`].
#[derive(Clone)]
pub struct AbortSignal {
    shared: Arc<Shared>,
}

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        self.shared.state.lock().reason.is_some()
    }

    /// The abort reason, `None` until aborted.
    pub fn reason(&self) -> Option<String> {
        self.shared.state.lock().reason.clone()
    }

    /// Register a listener for the abort. Registered after the abort,
    /// the listener is still dispatched asynchronously exactly once.
    pub fn add_event_listener(&self, listener: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        if state.reason.is_some() {
            drop(state);
            self.shared.scheduler.schedule_async(move || {
                listener();
                Ok(())
            });
        } else {
            state.listeners.push(Box::new(listener));
        }
    }

    /// Resolves once the context has been aborted.
    pub async fn cancelled(&self) {
        self.shared.token.cancelled().await;
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.aborted())
            .field("reason", &self.reason())
            .finish()
    }
}
