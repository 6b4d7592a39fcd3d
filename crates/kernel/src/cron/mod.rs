//! Scheduled background jobs for extensions.
//!
//! Each extension gets a [`CronEngine`] holding its registered jobs. A
//! tick task computes the current [`Moment`] once per interval and fires
//! every due job through the extension's scheduler, so job callbacks run
//! on the engine worker and never overlap other engine work.

mod schedule;

pub use schedule::{Moment, Schedule};

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{HostError, HostResult};
use crate::scheduler::Scheduler;

/// Default tick interval. Matching is minute-resolution, so ticking
/// faster than this only makes sense in tests.
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

type CronFn = dyn Fn() -> anyhow::Result<()> + Send + Sync;

/// Timezone the engine evaluates schedules in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CronTimezone {
    #[default]
    Utc,
    Local,
}

impl CronTimezone {
    /// Parse a configuration value (`"utc"` or `"local"`).
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "utc" => Some(Self::Utc),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

struct CronJob {
    id: String,
    schedule: Schedule,
    run: Arc<CronFn>,
}

/// Identifying details of a registered job.
#[derive(Debug, Clone, Serialize)]
pub struct CronJobInfo {
    pub id: String,
    pub expression: String,
}

struct CronInner {
    extension_id: String,
    scheduler: Scheduler,
    handle: Handle,
    timezone: CronTimezone,
    interval: Mutex<Duration>,
    jobs: Mutex<Vec<CronJob>>,
    // Present while a tick loop is running. Dropping the sender stops
    // the loop, so replacing or clearing this slot is all stop needs.
    ticker: Mutex<Option<watch::Sender<bool>>>,
}

/// Per-extension cron engine.
#[derive(Clone)]
pub struct CronEngine {
    inner: Arc<CronInner>,
}

impl CronEngine {
    /// Create an engine ticking every minute. Jobs do not fire until
    /// [`Self::start`] is called.
    pub fn new(
        extension_id: impl Into<String>,
        scheduler: Scheduler,
        handle: Handle,
        timezone: CronTimezone,
    ) -> Self {
        Self {
            inner: Arc::new(CronInner {
                extension_id: extension_id.into(),
                scheduler,
                handle,
                timezone,
                interval: Mutex::new(DEFAULT_TICK_INTERVAL),
                jobs: Mutex::new(Vec::new()),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Register a job. An invalid expression fails; re-using an id
    /// replaces the previous binding.
    pub fn add(
        &self,
        id: impl Into<String>,
        expression: &str,
        run: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> HostResult<()> {
        let schedule = Schedule::parse(expression)
            .map_err(|error| HostError::InvalidExpression(format!("{error:#}")))?;

        let id = id.into();
        let mut jobs = self.inner.jobs.lock();
        jobs.retain(|job| job.id != id);
        jobs.push(CronJob {
            id,
            schedule,
            run: Arc::new(run),
        });
        Ok(())
    }

    /// Remove a job by id. Unknown ids are ignored.
    pub fn remove(&self, id: &str) {
        self.inner.jobs.lock().retain(|job| job.id != id);
    }

    /// Remove every registered job.
    pub fn remove_all(&self) {
        self.inner.jobs.lock().clear();
    }

    /// Number of registered jobs.
    pub fn total(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    /// Ids and expressions of the registered jobs, in registration order.
    pub fn jobs(&self) -> Vec<CronJobInfo> {
        self.inner
            .jobs
            .lock()
            .iter()
            .map(|job| CronJobInfo {
                id: job.id.clone(),
                expression: job.schedule.expression().to_string(),
            })
            .collect()
    }

    /// Change the tick interval, restarting the ticker when running.
    pub fn set_interval(&self, interval: Duration) {
        let was_started = {
            let mut slot = self.inner.interval.lock();
            *slot = interval;
            self.has_started()
        };
        if was_started {
            self.start();
        }
    }

    /// Start ticking. The first tick is delayed to the next whole
    /// interval boundary; due jobs run at that boundary and at each tick
    /// after it. Starting an already started engine restarts its ticker.
    pub fn start(&self) {
        let interval = *self.inner.interval.lock();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        // Replacing the slot drops any previous sender, which stops the
        // previous loop.
        *self.inner.ticker.lock() = Some(stop_tx);

        let weak = Arc::downgrade(&self.inner);
        self.inner.handle.spawn(async move {
            let delay = delay_to_next_boundary(interval);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => return,
            }

            // The first tick of the interval fires immediately, which is
            // the boundary fire.
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { return };
                        inner.run_due();
                    }
                    _ = stop_rx.changed() => return,
                }
            }
        });
    }

    /// Stop ticking. Pending first-fire delays are cancelled and jobs
    /// stay registered for the next [`Self::start`].
    pub fn stop(&self) {
        self.inner.ticker.lock().take();
    }

    /// Whether the engine has been started and not stopped since.
    pub fn has_started(&self) -> bool {
        self.inner.ticker.lock().is_some()
    }

    #[cfg(test)]
    fn tick_now(&self) {
        self.inner.run_due();
    }
}

impl CronInner {
    /// Fire every job due at the current moment through the scheduler.
    fn run_due(&self) {
        let now = match self.timezone {
            CronTimezone::Utc => Moment::from_datetime(&Utc::now()),
            CronTimezone::Local => Moment::from_datetime(&Local::now()),
        };

        let due: Vec<(String, Arc<CronFn>)> = self
            .jobs
            .lock()
            .iter()
            .filter(|job| job.schedule.is_due(&now))
            .map(|job| (job.id.clone(), Arc::clone(&job.run)))
            .collect();

        for (id, run) in due {
            debug!(extension = %self.extension_id, job = %id, "cron job due");
            self.scheduler.schedule_async(move || run());
        }
    }
}

impl std::fmt::Debug for CronEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronEngine")
            .field("extension_id", &self.inner.extension_id)
            .field("jobs", &self.total())
            .finish_non_exhaustive()
    }
}

/// Time until the next whole interval boundary on the wall clock.
fn delay_to_next_boundary(interval: Duration) -> Duration {
    let interval_ms = interval.as_millis().max(1) as u64;
    let now_ms = Utc::now().timestamp_millis().max(0) as u64;
    let next_ms = (now_ms / interval_ms + 1) * interval_ms;
    Duration::from_millis(next_ms - now_ms)
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> CronEngine {
        let scheduler = Scheduler::new("cron-test").unwrap();
        CronEngine::new("cron-test", scheduler, Handle::current(), CronTimezone::Utc)
    }

    /// Wait until every job queued so far has run.
    fn drain(engine: &CronEngine) {
        engine.inner.scheduler.schedule(|| Ok(())).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_expression_is_rejected() {
        let engine = engine();
        let result = engine.add("bad", "not an expression", || Ok(()));
        assert!(matches!(result, Err(HostError::InvalidExpression(_))));
        assert_eq!(engine.total(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_id_replaces_previous_binding() {
        let engine = engine();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        engine
            .add("job", "* * * * *", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        let counter = Arc::clone(&second);
        engine
            .add("job", "* * * * *", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(engine.total(), 1);

        engine.tick_now();
        tokio::task::block_in_place(|| drain(&engine));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn jobs_run_on_the_scheduler_worker() {
        let engine = engine();
        let on_worker = Arc::new(AtomicUsize::new(0));

        let scheduler = engine.inner.scheduler.clone();
        let flag = Arc::clone(&on_worker);
        engine
            .add("where", "* * * * *", move || {
                if scheduler.on_worker_thread() {
                    flag.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .unwrap();

        engine.tick_now();
        tokio::task::block_in_place(|| drain(&engine));
        assert_eq!(on_worker.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_and_remove_all_unregister_jobs() {
        let engine = engine();
        engine.add("a", "@hourly", || Ok(())).unwrap();
        engine.add("b", "@daily", || Ok(())).unwrap();
        assert_eq!(engine.total(), 2);

        engine.remove("a");
        assert_eq!(engine.total(), 1);
        assert_eq!(engine.jobs()[0].id, "b");

        engine.remove("missing");
        assert_eq!(engine.total(), 1);

        engine.remove_all();
        assert_eq!(engine.total(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn jobs_expose_expanded_expressions() {
        let engine = engine();
        engine.add("five", "@5min", || Ok(())).unwrap();
        let jobs = engine.jobs();
        assert_eq!(jobs[0].id, "five");
        assert_eq!(jobs[0].expression, "*/5 * * * *");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ticker_fires_due_jobs_until_stopped() {
        let engine = engine();
        engine.set_interval(Duration::from_millis(50));

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        engine
            .add("always", "* * * * *", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        engine.start();
        assert!(engine.has_started());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(fired.load(Ordering::SeqCst) >= 2);

        engine.stop();
        assert!(!engine.has_started());
        tokio::task::block_in_place(|| drain(&engine));
        let after_stop = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after_stop);

        // Jobs stay registered across stop.
        assert_eq!(engine.total(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_replaces_the_previous_ticker() {
        let engine = engine();
        engine.set_interval(Duration::from_millis(50));

        engine.start();
        engine.start();
        assert!(engine.has_started());

        engine.stop();
        assert!(!engine.has_started());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_cancels_pending_first_fire() {
        let engine = engine();
        // Long interval keeps the loop inside the initial delay.
        engine.set_interval(Duration::from_secs(3600));

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        engine
            .add("never", "* * * * *", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        engine.start();
        engine.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
