//! Scope Supervisor
//!
//! A scope owns the scheduler primitives its continuations run on and
//! tracks every continuation from start to terminal state.
//!
//! # Lifecycle
//!
//! 1. [`launch`] creates the scope and hands a [`Run`] to the configurator
//! 2. The configurator starts blocking or async invocations
//! 3. `launch` waits until no continuation is outstanding
//! 4. Worker pool and event loop are shut down
//! 5. The summary is returned, or the first async failure as [`ScopeError`]
//!
//! The worker pool starts on the first async invocation and the event loop
//! on the first I/O step, so a scope that only runs blocking computations
//! never starts a thread.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use thiserror::Error;

use super::config::ScopeConfig;
use super::event_loop::EventLoop;
use super::pool::{Job, WorkerPool};
use crate::coroutine::chain::StepList;
use crate::coroutine::continuation::{ContinuationCore, Mode};
use crate::coroutine::{
    Continuation, ContinuationId, ContinuationState, Coroutine, CoroutineError, ErrorKind,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A failed or cancelled continuation recorded by its scope.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub continuation: ContinuationId,
    /// True if the continuation was started with [`Run::blocking`].
    pub blocking: bool,
    pub error: CoroutineError,
}

/// What happened inside a scope.
#[derive(Debug, Clone, Default)]
pub struct ScopeSummary {
    /// Continuations started
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Errors of every failed or cancelled continuation, in finishing order
    pub diagnostics: Vec<Diagnostic>,
    /// Worker pool threads (0 if the pool never started)
    pub worker_threads: usize,
    /// Event loop threads (0 if the loop never started)
    pub io_threads: usize,
    /// Channels still open after teardown
    pub open_channels: usize,
    pub elapsed: Duration,
}

impl ScopeSummary {
    /// Diagnostics of failures, cancellations excluded.
    pub fn failures(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| !d.error.is_cancellation())
    }
}

/// A scope that ended with a failure or was cancelled.
#[derive(Debug, Error)]
#[error("scope failed: {error}")]
pub struct ScopeError {
    /// The first async failure, or `ScopeCancelled`
    #[source]
    pub error: CoroutineError,
    pub summary: ScopeSummary,
}

impl ScopeError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[derive(Default)]
struct Failures {
    first: Option<CoroutineError>,
    diagnostics: Vec<Diagnostic>,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// State shared by a scope and all of its continuations.
pub(crate) struct ScopeShared {
    config: ScopeConfig,
    pool: OnceCell<WorkerPool>,
    event_loop: OnceCell<EventLoop>,
    registry: Mutex<HashMap<ContinuationId, Weak<ContinuationCore>>>,
    next_id: AtomicU64,
    outstanding: Mutex<usize>,
    drained: Condvar,
    cancelled: AtomicBool,
    failures: Mutex<Failures>,
    counters: Counters,
    started_at: Instant,
}

impl ScopeShared {
    fn new(config: ScopeConfig) -> Self {
        Self {
            config,
            pool: OnceCell::new(),
            event_loop: OnceCell::new(),
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            outstanding: Mutex::new(0),
            drained: Condvar::new(),
            cancelled: AtomicBool::new(false),
            failures: Mutex::new(Failures::default()),
            counters: Counters::default(),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn config(&self) -> &ScopeConfig {
        &self.config
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn pool(&self) -> Result<&WorkerPool, CoroutineError> {
        self.pool.get_or_try_init(|| {
            WorkerPool::start(
                self.config.workers,
                &self.config.thread_name,
                self.config.park_timeout(),
            )
            .map_err(|e| {
                error!("Failed to start worker pool: {}", e);
                CoroutineError::scheduler(e)
            })
        })
    }

    pub(crate) fn event_loop(&self) -> Result<&EventLoop, CoroutineError> {
        self.event_loop.get_or_try_init(|| {
            let event_loop = EventLoop::start(self.config.io_threads, &self.config.thread_name)
                .map_err(|e| {
                    error!("Failed to start event loop: {}", e);
                    CoroutineError::scheduler(e)
                })?;
            if self.is_cancelled() {
                event_loop.cancel_all();
            }
            Ok(event_loop)
        })
    }

    /// Queues a job on the worker pool.
    ///
    /// Runs the job inline if the pool is unavailable so a resumed
    /// continuation still reaches a terminal state.
    pub(crate) fn submit(&self, job: Job) {
        let rejected = match self.pool() {
            Ok(pool) => pool.submit(job).err(),
            Err(_) => Some(job),
        };

        if let Some(job) = rejected {
            debug!("Worker pool unavailable, running job inline");
            job();
        }
    }

    fn register(self: &Arc<Self>, steps: &StepList, mode: Mode) -> Arc<ContinuationCore> {
        let id = ContinuationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let core = ContinuationCore::new(id, Arc::clone(self), Arc::clone(steps), mode);

        lock(&self.registry).insert(id, Arc::downgrade(&core));
        *lock(&self.outstanding) += 1;
        self.counters.started.fetch_add(1, Ordering::Relaxed);

        core
    }

    /// Called exactly once per continuation when it reaches a terminal
    /// state.
    pub(crate) fn continuation_finished(
        &self,
        id: ContinuationId,
        mode: Mode,
        state: ContinuationState,
        error: Option<CoroutineError>,
    ) {
        lock(&self.registry).remove(&id);

        let counter = match state {
            ContinuationState::Completed => &self.counters.completed,
            ContinuationState::Cancelled => &self.counters.cancelled,
            _ => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(error) = error {
            let mut failures = lock(&self.failures);
            failures.diagnostics.push(Diagnostic {
                continuation: id,
                blocking: mode == Mode::Blocking,
                error: error.clone(),
            });

            let representative = state == ContinuationState::Failed
                && mode == Mode::Async
                && failures.first.is_none();

            if representative {
                failures.first = Some(error.clone());
                drop(failures);
                error!("Continuation {} failed, cancelling scope: {}", id, error);
                self.cancel();
            } else if state == ContinuationState::Failed {
                drop(failures);
                warn!("Continuation {} failed: {}", id, error);
            }
        }

        let mut outstanding = lock(&self.outstanding);
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.drained.notify_all();
        }
    }

    /// Cancels every tracked continuation and every pending transfer.
    pub(crate) fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            info!("Cancelling scope");
        }

        if let Some(event_loop) = self.event_loop.get() {
            event_loop.cancel_all();
        }

        // Collected first: finishing a continuation takes the registry lock.
        let live: Vec<Arc<ContinuationCore>> = lock(&self.registry)
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        debug!("Cancelling {} live continuations", live.len());
        for core in live {
            core.cancel();
        }
    }

    fn outstanding(&self) -> usize {
        *lock(&self.outstanding)
    }

    fn open_channels(&self) -> usize {
        self.event_loop
            .get()
            .map(EventLoop::open_channels)
            .unwrap_or(0)
    }

    fn wait_drained(&self) {
        let mut outstanding = lock(&self.outstanding);
        while *outstanding > 0 {
            outstanding = self
                .drained
                .wait(outstanding)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn teardown(&self) {
        if let Some(pool) = self.pool.get() {
            pool.shutdown();
        }
        if let Some(event_loop) = self.event_loop.get() {
            event_loop.shutdown();
        }
    }

    fn summary(&self) -> ScopeSummary {
        let diagnostics = lock(&self.failures).diagnostics.clone();

        ScopeSummary {
            started: self.counters.started.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            diagnostics,
            worker_threads: self.pool.get().map(WorkerPool::size).unwrap_or(0),
            io_threads: self.event_loop.get().map(EventLoop::threads).unwrap_or(0),
            open_channels: self.open_channels(),
            elapsed: self.started_at.elapsed(),
        }
    }

    fn outcome(&self, summary: ScopeSummary) -> Result<ScopeSummary, ScopeError> {
        let first = lock(&self.failures).first.clone();

        match first {
            Some(error) => Err(ScopeError { error, summary }),
            None if self.is_cancelled() => Err(ScopeError {
                error: CoroutineError::ScopeCancelled,
                summary,
            }),
            None => Ok(summary),
        }
    }
}

/// Invocation context handed to the configurator of [`launch`].
pub struct Run {
    shared: Arc<ScopeShared>,
}

impl Run {
    /// Runs `coroutine` on the calling thread and returns once it is
    /// terminal.
    ///
    /// A suspending step parks the caller until the step is resumed. A
    /// failure is returned through the continuation and recorded in the
    /// scope's diagnostics; it does not fail the scope.
    pub fn blocking<I, O>(&self, coroutine: &Coroutine<I, O>, input: I) -> Continuation<O>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let core = self.shared.register(coroutine.steps(), Mode::Blocking);
        core.run_blocking(Box::new(input));
        Continuation::new(core)
    }

    /// Submits `coroutine` to the worker pool and returns immediately.
    ///
    /// The returned handle may be dropped; the scope still waits for the
    /// invocation. The first async failure cancels the scope and becomes
    /// the error returned by [`launch`].
    pub fn spawn<I, O>(&self, coroutine: &Coroutine<I, O>, input: I) -> Continuation<O>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let core = self.shared.register(coroutine.steps(), Mode::Async);

        match self.shared.pool() {
            Ok(_) => {
                let job_core = Arc::clone(&core);
                self.shared
                    .submit(Box::new(move || job_core.run_async(0, Box::new(input))));
            }
            Err(error) => core.fail(error),
        }

        Continuation::new(core)
    }

    /// Cancels the scope: every tracked continuation stops at its next step
    /// boundary, suspended ones right away, and pending transfers release
    /// their channels.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Continuations started and not yet terminal.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding()
    }

    /// Channels currently open on the scope's event loop.
    pub fn open_channels(&self) -> usize {
        self.shared.open_channels()
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.shared.config
    }
}

/// Runs `configurator` in a scope with the default configuration.
///
/// See [`launch_with`].
pub fn launch<F>(configurator: F) -> Result<ScopeSummary, ScopeError>
where
    F: FnOnce(&Run),
{
    launch_with(ScopeConfig::default(), configurator)
}

/// Runs `configurator` in a scope and waits until every continuation it
/// started is terminal.
///
/// Returns the first async failure (or `ScopeCancelled` after an explicit
/// cancel) as [`ScopeError`]. If the configurator panics, the scope is
/// cancelled, drained and torn down before the panic continues.
///
/// # Example
///
/// ```
/// use corunner::{first, launch};
/// use corunner::steps::apply;
///
/// let square = first(apply(|x: u64| x * x));
///
/// let summary = launch(|run| {
///     for i in 0..100 {
///         run.spawn(&square, i);
///     }
/// })
/// .unwrap();
///
/// assert_eq!(summary.completed, 100);
/// ```
pub fn launch_with<F>(config: ScopeConfig, configurator: F) -> Result<ScopeSummary, ScopeError>
where
    F: FnOnce(&Run),
{
    if let Err(e) = config.validate() {
        return Err(ScopeError {
            error: CoroutineError::InvalidConfig(e.to_string()),
            summary: ScopeSummary::default(),
        });
    }

    info!(
        "Launching scope (workers: {}, io threads: {})",
        config.workers, config.io_threads
    );

    let shared = Arc::new(ScopeShared::new(config));
    let run = Run {
        shared: Arc::clone(&shared),
    };

    let configured = panic::catch_unwind(AssertUnwindSafe(|| configurator(&run)));
    if configured.is_err() {
        error!("Scope configurator panicked, cancelling");
        shared.cancel();
    }

    let waiting = shared.outstanding();
    if waiting > 0 {
        debug!("Waiting for {} outstanding continuations", waiting);
    }
    shared.wait_drained();
    shared.teardown();

    let summary = shared.summary();
    info!(
        "Scope drained in {:.2?}: {} completed, {} failed, {} cancelled",
        summary.elapsed, summary.completed, summary.failed, summary.cancelled
    );

    if let Err(payload) = configured {
        panic::resume_unwind(payload);
    }

    shared.outcome(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::{first, Execution, Resume, Step, Suspension};
    use crate::steps::{apply, try_apply};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    /// Suspends and hands its resume handle to the test.
    struct Park {
        held: Arc<Mutex<Vec<Resume<u32>>>>,
    }

    impl Step<u32, u32> for Park {
        fn execute(
            &self,
            _input: u32,
            suspension: Suspension<u32>,
        ) -> Result<Execution<u32>, CoroutineError> {
            let (resume, suspended) = suspension.suspend();
            lock(&self.held).push(resume);
            Ok(Execution::Suspended(suspended))
        }
    }

    fn parked(held: &Arc<Mutex<Vec<Resume<u32>>>>) -> usize {
        lock(held).len()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn odd_fails() -> Coroutine<u32, u32> {
        first(apply(|x: u32| x + 1))
            .then(try_apply(|x: u32| {
                if x % 2 == 0 {
                    Err(format!("{} is even", x))
                } else {
                    Ok(x * 3)
                }
            }).named("reject-even"))
    }

    #[test]
    fn test_blocking_and_spawn_agree() {
        let cr = odd_fails();

        for x in 0..10u32 {
            let mut blocking = None;
            let _ = launch(|run| blocking = Some(run.blocking(&cr, x).into_result()));
            let blocking = blocking.unwrap();

            let (tx, rx) = mpsc::channel();
            let scope = launch(|run| {
                tx.send(run.spawn(&cr, x)).unwrap();
            });
            let spawned = rx.recv().unwrap().into_result();

            match (blocking, spawned) {
                (Ok(a), Ok(b)) => {
                    assert_eq!(a, b);
                    assert!(scope.is_ok());
                }
                (Err(a), Err(b)) => {
                    assert_eq!(a.kind(), b.kind());
                    assert_eq!(scope.unwrap_err().kind(), a.kind());
                }
                (a, b) => panic!("modes disagree for {}: {:?} vs {:?}", x, a, b),
            }
        }
    }

    #[test]
    fn test_blocking_only_scope_starts_no_threads() {
        let cr = first(apply(|x: u32| x * 2));
        let summary = launch(|run| {
            assert_eq!(run.blocking(&cr, 4).into_result().unwrap(), 8);
        })
        .unwrap();

        assert_eq!(summary.worker_threads, 0);
        assert_eq!(summary.io_threads, 0);
        assert_eq!(summary.completed, 1);
    }

    #[test]
    fn test_launch_waits_for_every_spawn() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let cr = first(apply(move |x: u32| {
            thread::sleep(Duration::from_millis(1));
            counter.fetch_add(1, Ordering::SeqCst);
            x
        }));

        let summary = launch_with(ScopeConfig::new().with_workers(4), |run| {
            for i in 0..200 {
                run.spawn(&cr, i);
            }
        })
        .unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), 200);
        assert_eq!(summary.started, 200);
        assert_eq!(summary.completed, 200);
    }

    #[test]
    fn test_blocking_failure_does_not_fail_scope() {
        let cr = odd_fails();
        let summary = launch(|run| {
            let err = run.blocking(&cr, 1).into_result().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::StepFailure);
            assert!(!run.is_cancelled());
        })
        .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.diagnostics.len(), 1);
        assert!(summary.diagnostics[0].blocking);
    }

    #[test]
    fn test_first_async_failure_wins_and_cancels_siblings() {
        let held = Arc::new(Mutex::new(Vec::new()));
        let parking = first(Park {
            held: Arc::clone(&held),
        });
        let failing = odd_fails();

        let err = launch(|run| {
            for i in 0..5 {
                run.spawn(&parking, i);
            }
            wait_until(|| parked(&held) == 5);

            let failed = run.spawn(&failing, 1);
            assert_eq!(failed.wait(), ContinuationState::Failed);
            wait_until(|| run.is_cancelled());

            let late = run.spawn(&failing, 3);
            assert_eq!(late.wait(), ContinuationState::Cancelled);
        })
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StepFailure);
        assert!(err.to_string().contains("reject-even"));
        assert_eq!(err.summary.failed, 1);
        assert_eq!(err.summary.cancelled, 6);
        assert_eq!(err.summary.failures().count(), 1);
        assert_eq!(err.summary.diagnostics.len(), 7);
    }

    #[test]
    fn test_cancel_parked_continuations() {
        let held = Arc::new(Mutex::new(Vec::new()));
        let cr = first(Park {
            held: Arc::clone(&held),
        })
        .then(apply(|x: u32| x + 1));

        let err = launch_with(ScopeConfig::new().with_workers(8), |run| {
            for i in 0..1_000 {
                run.spawn(&cr, i);
            }
            wait_until(|| parked(&held) == 1_000);
            assert_eq!(run.outstanding(), 1_000);

            run.cancel();
            assert_eq!(run.outstanding(), 0);
        })
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ScopeCancelled);
        assert_eq!(err.summary.completed, 0);
        assert_eq!(err.summary.cancelled, 1_000);

        // Late resumes are ignored.
        for resume in lock(&held).drain(..) {
            resume.resume(7);
        }
    }

    /// Threads of this process whose name starts with `prefix`. Always 0
    /// where `/proc` is unavailable.
    fn live_threads(prefix: &str) -> usize {
        let Ok(tasks) = std::fs::read_dir("/proc/self/task") else {
            return 0;
        };
        tasks
            .filter_map(Result::ok)
            .filter_map(|task| std::fs::read_to_string(task.path().join("comm")).ok())
            .filter(|comm| comm.trim_end().starts_with(prefix))
            .count()
    }

    #[test]
    fn test_many_spawns_on_large_pool() {
        let cr = first(apply(|x: u64| x.wrapping_mul(31))).then(apply(|x: u64| x ^ 7));

        let config = ScopeConfig::new()
            .with_workers(64)
            .with_thread_name("bulk");
        let mut peak = 0;

        let summary = launch_with(config, |run| {
            for i in 0..100_000u64 {
                run.spawn(&cr, i);
                if i % 10_000 == 0 {
                    peak = peak.max(live_threads("bulk-"));
                }
            }
            peak = peak.max(live_threads("bulk-"));
        })
        .unwrap();

        if cfg!(target_os = "linux") {
            assert!(peak > 0, "no worker threads observed");
        }
        assert!(peak <= 64, "{} worker threads alive", peak);
        assert_eq!(live_threads("bulk-"), 0);
        assert_eq!(summary.worker_threads, 64);
        assert_eq!(summary.completed, 100_000);
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn test_explicit_cancel_returns_cancelled() {
        let err = launch(|run| run.cancel()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScopeCancelled);
        assert_eq!(err.summary.started, 0);
    }

    #[test]
    fn test_invocations_after_cancel_are_cancelled() {
        let cr = first(apply(|x: u32| x));
        let err = launch(|run| {
            run.cancel();
            let c = run.blocking(&cr, 1);
            assert_eq!(c.state(), ContinuationState::Cancelled);
            assert_eq!(c.into_result().unwrap_err().kind(), ErrorKind::ScopeCancelled);
        })
        .unwrap_err();

        assert_eq!(err.summary.cancelled, 1);
    }

    #[test]
    fn test_configurator_panic_drains_scope() {
        let held = Arc::new(Mutex::new(Vec::new()));
        let cr = first(Park {
            held: Arc::clone(&held),
        });
        let (tx, rx) = mpsc::channel();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            launch(|run| {
                tx.send(run.spawn(&cr, 1)).unwrap();
                wait_until(|| parked(&held) == 1);
                panic!("configurator failed");
            })
        }));

        assert!(result.is_err());
        let continuation = rx.recv().unwrap();
        assert_eq!(continuation.state(), ContinuationState::Cancelled);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = launch_with(ScopeConfig::new().with_workers(0), |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_worker_thread_names_follow_config() {
        let cr = first(apply(|_: ()| thread::current().name().map(str::to_string)));
        let (tx, rx) = mpsc::channel();

        launch_with(ScopeConfig::new().with_workers(1).with_thread_name("probe"), |run| {
            tx.send(run.spawn(&cr, ())).unwrap();
        })
        .unwrap();

        let name = rx.recv().unwrap().into_result().unwrap();
        assert_eq!(name.as_deref(), Some("probe-worker-0"));
    }
}
