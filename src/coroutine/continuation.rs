//! Continuations
//!
//! A continuation is the per-invocation record of a coroutine run: the
//! position in the step list, the value handed between steps, the terminal
//! outcome and the cancellation flag. It is the only mutable pipeline
//! state; steps and coroutines are never touched by execution.
//!
//! Two drivers share one stepping core:
//!
//! - blocking: the caller's thread executes every step inline and waits on
//!   a condition variable while a step is suspended
//! - async: every step boundary and every resume is a job on the scope's
//!   worker pool, so no thread is held while a step is suspended

use std::any::{type_name, Any};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, trace};

use super::chain::StepList;
use super::error::CoroutineError;
use crate::execution::channel::ChannelTable;
use crate::execution::event_loop::IoContext;
use crate::execution::scope::ScopeShared;

/// A value travelling between two steps.
pub(crate) type Value = Box<dyn Any + Send>;

/// Identity of a continuation inside its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContinuationId(pub(crate) u64);

impl ContinuationId {
    /// Returns the raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContinuationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a continuation.
///
/// `Pending → Running(i) → {Suspended(i) → Running(i + 1)}* → terminal`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationState {
    /// Created, first step not started yet
    Pending,
    /// Executing (or about to execute) the step at this index
    Running(usize),
    /// Waiting for the step at this index to be resumed
    Suspended(usize),
    /// All steps finished
    Completed,
    /// A step failed
    Failed,
    /// Stopped at a step boundary because of cancellation
    Cancelled,
}

impl ContinuationState {
    /// True for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// How a continuation is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Blocking,
    Async,
}

struct Slot {
    state: ContinuationState,
    /// A step is inside `execute`.
    executing: bool,
    /// The executing step called `suspend`.
    suspended: bool,
    /// Resume hand-off for the blocking driver, and for resumes that
    /// arrive while the step is still executing.
    resumed: Option<Result<Value, CoroutineError>>,
    outcome: Option<Result<Value, CoroutineError>>,
    error: Option<CoroutineError>,
}

enum Advance {
    Next(Value),
    Suspended,
    Finished,
}

pub(crate) struct ContinuationCore {
    id: ContinuationId,
    scope: Arc<ScopeShared>,
    steps: StepList,
    mode: Mode,
    cancelled: AtomicBool,
    slot: Mutex<Slot>,
    changed: Condvar,
    channels: Arc<ChannelTable>,
}

impl ContinuationCore {
    pub(crate) fn new(
        id: ContinuationId,
        scope: Arc<ScopeShared>,
        steps: StepList,
        mode: Mode,
    ) -> Arc<Self> {
        let channels = Arc::new(ChannelTable::new());
        Arc::new(Self {
            id,
            scope,
            steps,
            mode,
            cancelled: AtomicBool::new(false),
            slot: Mutex::new(Slot {
                state: ContinuationState::Pending,
                executing: false,
                suspended: false,
                resumed: None,
                outcome: None,
                error: None,
            }),
            changed: Condvar::new(),
            channels,
        })
    }

    pub(crate) fn id(&self) -> ContinuationId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> ContinuationState {
        self.lock().state
    }

    pub(crate) fn step_name(&self, position: usize) -> &str {
        self.steps.get(position).map(|s| s.name()).unwrap_or("<end>")
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.scope.is_cancelled()
    }

    /// Marks the continuation cancelled. A continuation parked in
    /// `Suspended` terminates right away; a running one stops at its next
    /// step boundary.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);

        let slot = self.lock();
        if matches!(slot.state, ContinuationState::Suspended(_)) {
            self.finish_locked(slot, Err(CoroutineError::ScopeCancelled));
        }
    }

    pub(crate) fn io_context(&self) -> Result<IoContext, CoroutineError> {
        let event_loop = self.scope.event_loop()?;
        Ok(event_loop.context(
            Arc::clone(&self.channels),
            self.scope.config().io_timeout(),
        ))
    }

    /// Runs the whole chain on the calling thread.
    pub(crate) fn run_blocking(self: &Arc<Self>, input: Value) {
        let mut position = 0;
        let mut value = input;

        loop {
            match self.step_at(position, value) {
                Advance::Next(next) => {
                    position += 1;
                    value = next;
                }
                Advance::Suspended => match self.wait_resumed() {
                    Some(Ok(next)) => {
                        position += 1;
                        value = next;
                    }
                    Some(Err(error)) => {
                        self.finish(Err(error));
                        return;
                    }
                    None => return,
                },
                Advance::Finished => return,
            }
        }
    }

    /// Executes the step at `position` on the current worker and queues the
    /// following one.
    pub(crate) fn run_async(self: Arc<Self>, position: usize, value: Value) {
        if let Advance::Next(next) = self.step_at(position, value) {
            let core = Arc::clone(&self);
            self.scope
                .submit(Box::new(move || core.run_async(position + 1, next)));
        }
    }

    fn step_at(self: &Arc<Self>, position: usize, value: Value) -> Advance {
        if self.is_cancelled() {
            self.finish(Err(CoroutineError::ScopeCancelled));
            return Advance::Finished;
        }

        let Some(step) = self.steps.get(position).cloned() else {
            self.finish(Ok(value));
            return Advance::Finished;
        };

        {
            let mut slot = self.lock();
            if slot.state.is_terminal() {
                return Advance::Finished;
            }
            slot.state = ContinuationState::Running(position);
            slot.executing = true;
            slot.suspended = false;
            slot.resumed = None;
        }

        trace!("Continuation {} running step {} '{}'", self.id, position, step.name());

        let cursor = Cursor {
            core: Arc::clone(self),
            position,
        };

        let executed =
            panic::catch_unwind(AssertUnwindSafe(|| step.execute_erased(value, cursor)));

        let mut slot = self.lock();
        slot.executing = false;
        if slot.state.is_terminal() {
            return Advance::Finished;
        }

        match executed {
            Ok(Ok(Some(next))) if !slot.suspended => Advance::Next(next),
            Ok(Ok(Some(_))) => {
                // Completing after suspending would run the next step twice.
                let error = match slot.resumed.take() {
                    Some(Err(error)) => error,
                    _ => CoroutineError::step_failure(
                        step.name(),
                        "step completed after suspending",
                    ),
                };
                self.finish_locked(slot, Err(error));
                Advance::Finished
            }
            Ok(Ok(None)) => match self.mode {
                Mode::Blocking => Advance::Suspended,
                Mode::Async => match slot.resumed.take() {
                    Some(Ok(next)) => Advance::Next(next),
                    Some(Err(error)) => {
                        self.finish_locked(slot, Err(error));
                        Advance::Finished
                    }
                    None => Advance::Suspended,
                },
            },
            Ok(Err(error)) => {
                self.finish_locked(slot, Err(error));
                Advance::Finished
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.finish_locked(
                    slot,
                    Err(CoroutineError::step_failure(
                        step.name(),
                        format!("step panicked: {}", message),
                    )),
                );
                Advance::Finished
            }
        }
    }

    fn wait_resumed(&self) -> Option<Result<Value, CoroutineError>> {
        let mut slot = self.lock();
        loop {
            if slot.state.is_terminal() {
                return None;
            }
            if let Some(result) = slot.resumed.take() {
                return Some(result);
            }
            slot = self
                .changed
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn mark_suspended(&self, position: usize) {
        let mut slot = self.lock();
        if slot.state.is_terminal() {
            return;
        }
        slot.state = ContinuationState::Suspended(position);
        slot.suspended = true;

        // A cancel sweep that ran while the step was executing missed us.
        if self.is_cancelled() {
            self.finish_locked(slot, Err(CoroutineError::ScopeCancelled));
        }
    }

    /// Delivers the outcome of the suspended step at `position`.
    ///
    /// Ignored unless the continuation is still suspended at exactly that
    /// step, so late or duplicate resumes after cancellation are harmless.
    fn resume(self: &Arc<Self>, position: usize, result: Result<Value, CoroutineError>) {
        let mut slot = self.lock();
        if slot.state != ContinuationState::Suspended(position) {
            trace!(
                "Continuation {} ignoring resume of step {} in state {:?}",
                self.id,
                position,
                slot.state
            );
            return;
        }

        // While the step is still executing, the driver picks the outcome
        // up once `execute` returns.
        if self.mode == Mode::Blocking || slot.executing {
            slot.state = ContinuationState::Running(position);
            slot.resumed = Some(result);
            drop(slot);
            self.changed.notify_all();
            return;
        }

        match result {
            Ok(value) => {
                slot.state = ContinuationState::Running(position);
                drop(slot);
                let core = Arc::clone(self);
                self.scope
                    .submit(Box::new(move || core.run_async(position + 1, value)));
            }
            Err(error) => self.finish_locked(slot, Err(error)),
        }
    }

    /// Terminates a continuation that never got to run.
    pub(crate) fn fail(&self, error: CoroutineError) {
        self.finish(Err(error));
    }

    fn finish(&self, result: Result<Value, CoroutineError>) {
        let slot = self.lock();
        self.finish_locked(slot, result);
    }

    fn finish_locked(&self, mut slot: MutexGuard<'_, Slot>, result: Result<Value, CoroutineError>) {
        if slot.state.is_terminal() {
            return;
        }

        let (state, error) = match &result {
            Ok(_) => (ContinuationState::Completed, None),
            Err(error) if error.is_cancellation() => {
                (ContinuationState::Cancelled, Some(error.clone()))
            }
            Err(error) => (ContinuationState::Failed, Some(error.clone())),
        };

        slot.state = state;
        slot.resumed = None;
        slot.error = error.clone();
        slot.outcome = Some(result);
        drop(slot);

        self.channels.clear();

        debug!("Continuation {} finished: {:?}", self.id, state);
        self.scope
            .continuation_finished(self.id, self.mode, state, error);
        self.changed.notify_all();
    }

    fn wait_terminal(&self, timeout: Option<Duration>) -> Option<ContinuationState> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.lock();

        loop {
            if slot.state.is_terminal() {
                return Some(slot.state);
            }

            match deadline {
                None => {
                    slot = self
                        .changed
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    slot = self
                        .changed
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }
}

/// Points at the step currently executing for one continuation.
pub(crate) struct Cursor {
    core: Arc<ContinuationCore>,
    position: usize,
}

impl Cursor {
    pub(crate) fn core(&self) -> &Arc<ContinuationCore> {
        &self.core
    }

    pub(crate) fn step_name(&self) -> &str {
        self.core.step_name(self.position)
    }

    pub(crate) fn suspend(&self) {
        self.core.mark_suspended(self.position);
    }

    pub(crate) fn resume(self, result: Result<Value, CoroutineError>) {
        self.core.resume(self.position, result);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Caller-side handle of one coroutine invocation.
///
/// Returned finished by [`Run::blocking`](crate::Run::blocking) and
/// possibly still running by [`Run::spawn`](crate::Run::spawn). Dropping the
/// handle does not stop the invocation; the scope keeps tracking it.
pub struct Continuation<O> {
    core: Arc<ContinuationCore>,
    _marker: PhantomData<fn() -> O>,
}

impl<O: Send + 'static> Continuation<O> {
    pub(crate) fn new(core: Arc<ContinuationCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    /// Returns the id of this continuation within its scope.
    pub fn id(&self) -> ContinuationId {
        self.core.id()
    }

    /// Returns the current state.
    pub fn state(&self) -> ContinuationState {
        self.core.state()
    }

    /// True once the continuation reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Requests cancellation, observed at the next step boundary.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// Blocks until the continuation is terminal and returns that state.
    ///
    /// Must not be called from inside a step: the worker would wait on work
    /// that may need the same worker to progress.
    pub fn wait(&self) -> ContinuationState {
        self.core
            .wait_terminal(None)
            .unwrap_or(ContinuationState::Failed)
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ContinuationState> {
        self.core.wait_terminal(Some(timeout))
    }

    /// Returns the terminal error, if the continuation failed or was
    /// cancelled.
    pub fn error(&self) -> Option<CoroutineError> {
        self.core.lock().error.clone()
    }

    /// Waits for the continuation and returns its result.
    pub fn into_result(self) -> Result<O, CoroutineError> {
        self.wait();

        let outcome = self.core.lock().outcome.take();
        match outcome {
            Some(Ok(value)) => value.downcast::<O>().map(|v| *v).map_err(|_| {
                CoroutineError::Composition {
                    step: self.core.step_name(self.core.steps.len().saturating_sub(1)).to_string(),
                    expected: type_name::<O>(),
                    found: "<unknown>",
                }
            }),
            Some(Err(error)) => Err(error),
            None => Err(self.error().unwrap_or(CoroutineError::ScopeCancelled)),
        }
    }
}

impl<O> fmt::Debug for Continuation<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::{first, CoroutineError, ErrorKind, Execution, Step, Suspension};
    use crate::execution::scope::launch;
    use crate::steps::apply;
    use std::sync::mpsc;

    /// Suspends and resumes from a helper thread after a short delay.
    struct Deferred;

    impl Step<u32, u32> for Deferred {
        fn execute(
            &self,
            input: u32,
            suspension: Suspension<u32>,
        ) -> Result<Execution<u32>, CoroutineError> {
            let (resume, suspended) = suspension.suspend();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                resume.resume(input * 10);
            });
            Ok(Execution::Suspended(suspended))
        }
    }

    /// Suspends and drops the resume handle without resuming.
    struct Forgetful;

    impl Step<u32, u32> for Forgetful {
        fn execute(
            &self,
            _input: u32,
            suspension: Suspension<u32>,
        ) -> Result<Execution<u32>, CoroutineError> {
            let (resume, suspended) = suspension.suspend();
            drop(resume);
            Ok(Execution::Suspended(suspended))
        }
    }

    /// Suspends, then breaks the contract by completing anyway.
    struct SuspendThenComplete;

    impl Step<u32, u32> for SuspendThenComplete {
        fn execute(
            &self,
            input: u32,
            suspension: Suspension<u32>,
        ) -> Result<Execution<u32>, CoroutineError> {
            let (resume, _suspended) = suspension.suspend();
            drop(resume);
            Ok(Execution::Complete(input * 2))
        }
    }

    /// Suspends and resumes from the executing thread before returning.
    struct Immediate;

    impl Step<u32, u32> for Immediate {
        fn execute(
            &self,
            input: u32,
            suspension: Suspension<u32>,
        ) -> Result<Execution<u32>, CoroutineError> {
            let (resume, suspended) = suspension.suspend();
            resume.resume(input + 1);
            Ok(Execution::Suspended(suspended))
        }
    }

    #[test]
    fn test_state_terminal() {
        assert!(ContinuationState::Completed.is_terminal());
        assert!(ContinuationState::Failed.is_terminal());
        assert!(ContinuationState::Cancelled.is_terminal());
        assert!(!ContinuationState::Pending.is_terminal());
        assert!(!ContinuationState::Running(0).is_terminal());
        assert!(!ContinuationState::Suspended(2).is_terminal());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(ContinuationId(7).to_string(), "#7");
        assert_eq!(ContinuationId(7).get(), 7);
    }

    #[test]
    fn test_blocking_suspension_resumes_inline() {
        let cr = first(apply(|x: u32| x + 1)).then(Deferred).then(apply(|x: u32| x + 2));

        launch(|run| {
            let continuation = run.blocking(&cr, 1);
            assert_eq!(continuation.state(), ContinuationState::Completed);
            assert_eq!(continuation.into_result().unwrap(), 22);
        })
        .unwrap();
    }

    #[test]
    fn test_async_suspension_resumes_on_pool() {
        let cr = first(Deferred).then(apply(|x: u32| x.to_string()));
        let (tx, rx) = mpsc::channel();

        launch(|run| {
            let continuation = run.spawn(&cr, 4);
            tx.send(continuation).unwrap();
        })
        .unwrap();

        let continuation = rx.recv().unwrap();
        assert!(continuation.is_finished());
        assert_eq!(continuation.into_result().unwrap(), "40");
    }

    #[test]
    fn test_dropped_resume_fails_continuation() {
        let cr = first(Forgetful).then(apply(|x: u32| x + 1));

        let summary = launch(|run| {
            let continuation = run.blocking(&cr, 1);
            assert_eq!(continuation.state(), ContinuationState::Failed);
            let err = continuation.into_result().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::StepFailure);
            assert!(err.to_string().contains("dropped"));
        })
        .unwrap();

        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_complete_after_suspend_fails_in_both_modes() {
        let cr = first(SuspendThenComplete).then(apply(|x: u32| x * 2));
        let (tx, rx) = mpsc::channel();

        let result = launch(|run| {
            let blocking = run.blocking(&cr, 1);
            assert_eq!(blocking.state(), ContinuationState::Failed);
            tx.send(blocking.into_result()).unwrap();

            let spawned = run.spawn(&cr, 1);
            spawned.wait();
            tx.send(spawned.into_result()).unwrap();
        });

        let blocking = rx.recv().unwrap().unwrap_err();
        let spawned = rx.recv().unwrap().unwrap_err();
        assert_eq!(blocking.kind(), ErrorKind::StepFailure);
        assert_eq!(spawned.kind(), ErrorKind::StepFailure);
        assert_eq!(blocking.to_string(), spawned.to_string());

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StepFailure);
        assert_eq!(err.summary.failed, 2);
    }

    #[test]
    fn test_resume_inside_execute() {
        let cr = first(Immediate).then(Immediate).then(apply(|x: u32| x * 10));
        let (tx, rx) = mpsc::channel();

        let summary = launch(|run| {
            assert_eq!(run.blocking(&cr, 1).into_result().unwrap(), 30);
            tx.send(run.spawn(&cr, 2)).unwrap();
        })
        .unwrap();

        assert_eq!(rx.recv().unwrap().into_result().unwrap(), 40);
        assert_eq!(summary.completed, 2);
    }

    #[test]
    fn test_panicking_step_becomes_step_failure() {
        let cr = first(apply(|x: u32| -> u32 {
            if x > 0 {
                panic!("boom");
            }
            x
        }));

        launch(|run| {
            let err = run.blocking(&cr, 1).into_result().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::StepFailure);
            assert!(err.to_string().contains("boom"));
        })
        .unwrap();
    }

    #[test]
    fn test_wait_timeout_on_finished() {
        let cr = first(apply(|x: u32| x));

        launch(|run| {
            let continuation = run.blocking(&cr, 3);
            assert_eq!(
                continuation.wait_timeout(Duration::from_millis(1)),
                Some(ContinuationState::Completed)
            );
            assert!(continuation.error().is_none());
            assert!(format!("{:?}", continuation).contains("Completed"));
        })
        .unwrap();
    }
}
