//! Step Contract
//!
//! A [`Step`] is the smallest unit of pipeline work. It receives the value
//! produced by the previous step together with a [`Suspension`] handle for
//! the continuation executing it, and either
//!
//! - returns [`Execution::Complete`] with its output, or
//! - calls [`Suspension::suspend`], passes the [`Resume`] handle to whatever
//!   will produce the output later, and returns [`Execution::Suspended`].
//!
//! `suspend` consumes the handle, so a step can suspend at most once per
//! invocation. Steps are shared by every continuation of a coroutine and
//! must keep all per-invocation state in the values they pass along.

use std::marker::PhantomData;

use super::continuation::{ContinuationId, Cursor};
use super::error::CoroutineError;
use crate::execution::event_loop::IoContext;

/// A unit of work turning an `I` into an `O`.
///
/// # Example
///
/// ```
/// use corunner::coroutine::{CoroutineError, Execution, Step, Suspension};
///
/// struct Double;
///
/// impl Step<u64, u64> for Double {
///     fn execute(
///         &self,
///         input: u64,
///         _suspension: Suspension<u64>,
///     ) -> Result<Execution<u64>, CoroutineError> {
///         Ok(Execution::Complete(input * 2))
///     }
/// }
/// ```
pub trait Step<I, O>: Send + Sync + 'static {
    /// Executes the step for one continuation.
    fn execute(&self, input: I, suspension: Suspension<O>)
        -> Result<Execution<O>, CoroutineError>;

    /// Name used in logs and error messages.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// What a step did with its invocation.
#[derive(Debug)]
pub enum Execution<O> {
    /// The step produced its output synchronously.
    Complete(O),
    /// The step suspended; its [`Resume`] handle will deliver the output.
    Suspended(Suspended),
}

/// Proof that [`Suspension::suspend`] was called.
#[derive(Debug)]
pub struct Suspended(());

/// Handle given to a step for the continuation executing it.
pub struct Suspension<O> {
    cursor: Cursor,
    _marker: PhantomData<fn(O)>,
}

impl<O: Send + 'static> Suspension<O> {
    pub(crate) fn new(cursor: Cursor) -> Self {
        Self {
            cursor,
            _marker: PhantomData,
        }
    }

    /// Id of the continuation executing the step.
    pub fn continuation_id(&self) -> ContinuationId {
        self.cursor.core().id()
    }

    /// True if the continuation or its scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cursor.core().is_cancelled()
    }

    /// Access to the scope's I/O event loop, started on first use.
    pub fn io(&self) -> Result<IoContext, CoroutineError> {
        self.cursor.core().io_context()
    }

    /// Parks the continuation at this step.
    ///
    /// The returned [`Resume`] must eventually be resumed or failed;
    /// dropping it fails the continuation.
    pub fn suspend(self) -> (Resume<O>, Suspended) {
        self.cursor.suspend();
        (
            Resume {
                cursor: Some(self.cursor),
                _marker: PhantomData,
            },
            Suspended(()),
        )
    }
}

/// Delivers the outcome of a suspended step.
///
/// For blocking invocations this wakes the waiting caller; for async ones
/// it queues the next step on the worker pool.
pub struct Resume<O> {
    cursor: Option<Cursor>,
    _marker: PhantomData<fn(O)>,
}

impl<O: Send + 'static> Resume<O> {
    /// Id of the suspended continuation.
    pub fn continuation_id(&self) -> Option<ContinuationId> {
        self.cursor.as_ref().map(|c| c.core().id())
    }

    /// Completes the suspended step with `value`.
    pub fn resume(mut self, value: O) {
        if let Some(cursor) = self.cursor.take() {
            cursor.resume(Ok(Box::new(value)));
        }
    }

    /// Fails the suspended step.
    pub fn fail(mut self, error: CoroutineError) {
        if let Some(cursor) = self.cursor.take() {
            cursor.resume(Err(error));
        }
    }
}

impl<O> Drop for Resume<O> {
    fn drop(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            let error = CoroutineError::step_failure(
                cursor.step_name(),
                "resume handle dropped before the step finished",
            );
            cursor.resume(Err(error));
        }
    }
}
