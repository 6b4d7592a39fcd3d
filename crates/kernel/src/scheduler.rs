//! Single-consumer job scheduler.
//!
//! Every extension owns one [`Scheduler`]. Its worker is a dedicated OS
//! thread, and the extension's script engine is only ever touched from job
//! bodies running on that thread. Host tasks that need the engine submit
//! jobs; they never reach into it directly.
//!
//! Jobs run strictly in submission order. A job that synchronously submits
//! another job is detected by thread identity and the nested job runs
//! immediately on the worker stack, so the nested submission completes
//! before its parent resumes and the worker never deadlocks on itself.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

/// Queue capacity. Submissions beyond this block (synchronous) or are
/// dropped (asynchronous).
const JOB_QUEUE_CAPACITY: usize = 9999;

/// Scheduler-level failures. Job bodies report their own failures as
/// [`SchedulerError::Job`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler has been stopped; the job did not run.
    #[error("scheduler is stopped")]
    Stopped,

    /// The queue was full and the job was dropped.
    #[error("job queue is full")]
    QueueFull,

    /// The caller abandoned the wait; the job still runs when reached.
    #[error("timed out waiting for job after {0:?}")]
    Timeout(Duration),

    /// The job body returned an error (or panicked).
    #[error(transparent)]
    Job(#[from] anyhow::Error),
}

type JobFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;
type SyncResultTx = std_mpsc::SyncSender<Result<(), SchedulerError>>;
type OnException = Arc<RwLock<Option<Arc<dyn Fn(&anyhow::Error) + Send + Sync>>>>;

enum Payload {
    Run(JobFn),
    /// Wakes the worker so it observes the stop flag.
    Wake,
}

struct Job {
    payload: Payload,
    /// Present for synchronous submissions; the worker sends the outcome.
    result_tx: Option<SyncResultTx>,
}

enum JobOutcome {
    Ok,
    Error(anyhow::Error),
    Panicked(anyhow::Error),
}

/// Single-consumer job scheduler for one extension.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    extension_id: String,
    tx: mpsc::Sender<Job>,
    stopped: Arc<AtomicBool>,
    on_exception: OnException,
    worker_thread: ThreadId,
    worker_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn a scheduler with the default queue capacity.
    pub fn new(extension_id: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_capacity(extension_id, JOB_QUEUE_CAPACITY)
    }

    /// Spawn a scheduler with an explicit queue capacity. Used by tests.
    pub fn with_capacity(
        extension_id: impl Into<String>,
        capacity: usize,
    ) -> anyhow::Result<Self> {
        let extension_id = extension_id.into();
        let (tx, mut rx) = mpsc::channel::<Job>(capacity);
        let stopped = Arc::new(AtomicBool::new(false));
        let on_exception: OnException = Arc::new(RwLock::new(None));

        let worker = {
            let extension_id = extension_id.clone();
            let stopped = Arc::clone(&stopped);
            let on_exception = Arc::clone(&on_exception);
            thread::Builder::new()
                .name(format!("scheduler-{extension_id}"))
                .spawn(move || {
                    debug!(ext = %extension_id, "scheduler worker started");
                    loop {
                        let Some(job) = rx.blocking_recv() else {
                            break;
                        };
                        if stopped.load(Ordering::SeqCst) {
                            reject_stopped(job);
                            while let Ok(job) = rx.try_recv() {
                                reject_stopped(job);
                            }
                            break;
                        }
                        let Payload::Run(f) = job.payload else {
                            continue;
                        };
                        dispatch_outcome(run_contained(f), job.result_tx, &on_exception);
                    }
                    debug!(ext = %extension_id, "scheduler worker stopped");
                })
                .context("failed to spawn scheduler worker thread")?
        };

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                extension_id,
                tx,
                stopped,
                on_exception,
                worker_thread: worker.thread().id(),
                worker_handle: Mutex::new(Some(worker)),
            }),
        })
    }

    /// Register the sink for exceptions with no synchronous caller to
    /// receive them: async job failures, panics, and dropped submissions.
    pub fn set_on_exception(&self, callback: impl Fn(&anyhow::Error) + Send + Sync + 'static) {
        *self.inner.on_exception.write() = Some(Arc::new(callback));
    }

    /// Submit a job and block until it has run, returning its result.
    ///
    /// Called from the worker itself (a job submitting a nested job), the
    /// job runs immediately on the worker stack, before the caller resumes.
    /// Must not be called from an async context; submit from Tokio tasks
    /// with [`schedule_async`](Self::schedule_async) or wrap the call in
    /// `spawn_blocking`.
    pub fn schedule(
        &self,
        f: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) -> Result<(), SchedulerError> {
        if thread::current().id() == self.inner.worker_thread {
            return self.run_inline(Box::new(f));
        }
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }

        let (result_tx, result_rx) = std_mpsc::sync_channel(1);
        let job = Job {
            payload: Payload::Run(Box::new(f)),
            result_tx: Some(result_tx),
        };
        self.inner
            .tx
            .blocking_send(job)
            .map_err(|_| SchedulerError::Stopped)?;
        result_rx.recv().map_err(|_| SchedulerError::Stopped)?
    }

    /// Submit a job and return immediately. Failures are reported through
    /// the exception sink; if the queue is full the job is dropped.
    pub fn schedule_async(&self, f: impl FnOnce() -> anyhow::Result<()> + Send + 'static) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            self.report(&anyhow::Error::from(SchedulerError::Stopped));
            return;
        }
        let job = Job {
            payload: Payload::Run(Box::new(f)),
            result_tx: None,
        };
        match self.inner.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(ext = %self.inner.extension_id, "job queue full; dropping async job");
                self.report(&anyhow::Error::from(SchedulerError::QueueFull));
            }
            Err(TrySendError::Closed(_)) => {
                self.report(&anyhow::Error::from(SchedulerError::Stopped));
            }
        }
    }

    /// As [`schedule`](Self::schedule), but the caller gives up waiting
    /// after `timeout`. The job is not cancelled: it still runs when the
    /// worker reaches it, and its result is discarded.
    pub fn schedule_with_timeout(
        &self,
        f: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
        timeout: Duration,
    ) -> Result<(), SchedulerError> {
        if thread::current().id() == self.inner.worker_thread {
            // Nested submissions run inline; there is nothing to wait on.
            return self.run_inline(Box::new(f));
        }
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }

        let (result_tx, result_rx) = std_mpsc::sync_channel(1);
        let job = Job {
            payload: Payload::Run(Box::new(f)),
            result_tx: Some(result_tx),
        };
        self.inner
            .tx
            .blocking_send(job)
            .map_err(|_| SchedulerError::Stopped)?;
        match result_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(std_mpsc::RecvTimeoutError::Timeout) => Err(SchedulerError::Timeout(timeout)),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(SchedulerError::Stopped),
        }
    }

    /// Stop the scheduler. The current job finishes; queued jobs are
    /// discarded, and their synchronous waiters observe
    /// [`SchedulerError::Stopped`]. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the worker if it is idle; a full queue wakes it anyway.
        let _ = self.inner.tx.try_send(Job {
            payload: Payload::Wake,
            result_tx: None,
        });
        if thread::current().id() != self.inner.worker_thread {
            if let Some(handle) = self.inner.worker_handle.lock().take() {
                let _ = handle.join();
            }
        }
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// True when the calling thread is this scheduler's worker, i.e. the
    /// caller is inside a job body.
    pub fn on_worker_thread(&self) -> bool {
        thread::current().id() == self.inner.worker_thread
    }

    fn run_inline(&self, f: JobFn) -> Result<(), SchedulerError> {
        match run_contained(f) {
            JobOutcome::Ok => Ok(()),
            JobOutcome::Error(err) => Err(SchedulerError::Job(err)),
            JobOutcome::Panicked(err) => {
                self.report(&err);
                Err(SchedulerError::Job(err))
            }
        }
    }

    fn report(&self, err: &anyhow::Error) {
        report(&self.inner.on_exception, err);
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        // Queued jobs are discarded rather than drained when the last
        // handle goes away.
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("extension_id", &self.inner.extension_id)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

fn run_contained(f: JobFn) -> JobOutcome {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => JobOutcome::Ok,
        Ok(Err(err)) => JobOutcome::Error(err),
        Err(payload) => JobOutcome::Panicked(anyhow::anyhow!(
            "job panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

fn dispatch_outcome(outcome: JobOutcome, result_tx: Option<SyncResultTx>, sink: &OnException) {
    match (outcome, result_tx) {
        (JobOutcome::Ok, Some(tx)) => {
            let _ = tx.send(Ok(()));
        }
        (JobOutcome::Ok, None) => {}
        (JobOutcome::Error(err), Some(tx)) => {
            let _ = tx.send(Err(SchedulerError::Job(err)));
        }
        (JobOutcome::Error(err), None) => report(sink, &err),
        (JobOutcome::Panicked(err), Some(tx)) => {
            report(sink, &err);
            let _ = tx.send(Err(SchedulerError::Job(err)));
        }
        (JobOutcome::Panicked(err), None) => report(sink, &err),
    }
}

fn reject_stopped(job: Job) {
    if let Some(tx) = job.result_tx {
        let _ = tx.send(Err(SchedulerError::Stopped));
    }
}

fn report(sink: &OnException, err: &anyhow::Error) {
    let callback = sink.read().clone();
    match callback {
        Some(callback) => callback(err),
        None => error!(error = %err, "unhandled scheduler exception"),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let scheduler = Scheduler::new("test").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let order = Arc::clone(&order);
            scheduler.schedule_async(move || {
                order.lock().push(i);
                Ok(())
            });
        }
        // A synchronous job queued last acts as a barrier.
        scheduler.schedule(|| Ok(())).unwrap();

        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_sync_job_returns_its_error() {
        let scheduler = Scheduler::new("test").unwrap();
        let err = scheduler
            .schedule(|| anyhow::bail!("engine exploded"))
            .unwrap_err();
        assert!(err.to_string().contains("engine exploded"));
    }

    #[test]
    fn test_nested_sync_submit_runs_before_parent_resumes() {
        let scheduler = Scheduler::new("test").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let outer_order = Arc::clone(&order);
        let outer_sched = scheduler.clone();
        scheduler
            .schedule(move || {
                outer_order.lock().push("A-start");
                let inner_order = Arc::clone(&outer_order);
                let inner_sched = outer_sched.clone();
                outer_sched
                    .schedule(move || {
                        inner_order.lock().push("B-start");
                        let leaf_order = Arc::clone(&inner_order);
                        inner_sched
                            .schedule(move || {
                                leaf_order.lock().push("C");
                                Ok(())
                            })
                            .map_err(anyhow::Error::from)?;
                        inner_order.lock().push("B-end");
                        Ok(())
                    })
                    .map_err(anyhow::Error::from)?;
                outer_order.lock().push("A-end");
                Ok(())
            })
            .unwrap();

        assert_eq!(
            *order.lock(),
            vec!["A-start", "B-start", "C", "B-end", "A-end"]
        );
    }

    #[test]
    fn test_single_job_executes_at_a_time() {
        let scheduler = Scheduler::new("test").unwrap();
        let running = Arc::new(AtomicI32::new(0));
        let max_seen = Arc::new(AtomicI32::new(0));

        let mut threads = Vec::new();
        for _ in 0..4 {
            let scheduler = scheduler.clone();
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            threads.push(thread::spawn(move || {
                for _ in 0..25 {
                    let running = Arc::clone(&running);
                    let max_seen = Arc::clone(&max_seen);
                    scheduler
                        .schedule(move || {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::yield_now();
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_abandons_wait_but_job_still_runs() {
        let scheduler = Scheduler::new("test").unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let job_ran = Arc::clone(&ran);
        let result = scheduler.schedule_with_timeout(
            move || {
                thread::sleep(Duration::from_millis(100));
                job_ran.store(true, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_millis(10),
        );
        assert!(matches!(result, Err(SchedulerError::Timeout(_))));

        // Barrier: once this returns, the abandoned job has completed.
        scheduler.schedule(|| Ok(())).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panic_is_contained_and_reported() {
        let scheduler = Scheduler::new("test").unwrap();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        scheduler.set_on_exception(move |err| sink.lock().push(err.to_string()));

        let err = scheduler
            .schedule(|| panic!("engine state corrupted"))
            .unwrap_err();
        assert!(err.to_string().contains("engine state corrupted"));

        scheduler.schedule_async(|| panic!("async boom"));
        scheduler.schedule(|| Ok(())).unwrap();

        let reported = reported.lock();
        assert_eq!(reported.len(), 2);
        assert!(reported[0].contains("engine state corrupted"));
        assert!(reported[1].contains("async boom"));
    }

    #[test]
    fn test_async_overflow_drops_and_reports() {
        let scheduler = Scheduler::with_capacity("test", 2).unwrap();
        let dropped = Arc::new(AtomicI32::new(0));
        let counter = Arc::clone(&dropped);
        scheduler.set_on_exception(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Hold the worker on a gate so the queue backs up.
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        scheduler.schedule_async(move || {
            let _ = gate_rx.recv();
            Ok(())
        });
        // Give the worker a moment to pick up the gate job.
        thread::sleep(Duration::from_millis(50));

        scheduler.schedule_async(|| Ok(()));
        scheduler.schedule_async(|| Ok(()));
        // Queue is now full; this one is dropped.
        scheduler.schedule_async(|| Ok(()));

        gate_tx.send(()).unwrap();
        scheduler.schedule(|| Ok(())).unwrap();

        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_discards_queued_jobs() {
        let scheduler = Scheduler::with_capacity("test", 10).unwrap();
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        scheduler.schedule_async(move || {
            let _ = gate_rx.recv();
            Ok(())
        });
        thread::sleep(Duration::from_millis(50));

        let waiter = {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.schedule(|| Ok(())))
        };
        thread::sleep(Duration::from_millis(50));

        let stopper = {
            let scheduler = scheduler.clone();
            thread::spawn(move || {
                scheduler.stop();
            })
        };
        // Let the stopper set the flag, then release the in-flight job.
        thread::sleep(Duration::from_millis(50));
        gate_tx.send(()).unwrap();

        assert!(matches!(
            waiter.join().unwrap(),
            Err(SchedulerError::Stopped)
        ));
        stopper.join().unwrap();
        assert!(matches!(
            scheduler.schedule(|| Ok(())),
            Err(SchedulerError::Stopped)
        ));
    }
}
