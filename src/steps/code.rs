//! Code Steps
//!
//! Steps wrapping plain functions. They never suspend; their work runs on
//! whichever thread drives the continuation.
//!
//! | Constructor   | Function            | Step           |
//! |---------------|---------------------|----------------|
//! | [`apply`]     | `Fn(I) -> O`        | `I -> O`       |
//! | [`try_apply`] | `Fn(I) -> Result<O, E>` | `I -> O`   |
//! | [`supply`]    | `Fn() -> O`         | `I -> O`       |
//! | [`consume`]   | `Fn(I)`             | `I -> ()`      |
//! | [`run`]       | `Fn()`              | `I -> ()`      |

use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::marker::PhantomData;

use crate::coroutine::{CoroutineError, Execution, Step, Suspension};

/// Marker of [`apply`] steps.
pub struct Apply<I, O>(PhantomData<fn(I) -> O>);
/// Marker of [`try_apply`] steps.
pub struct TryApply<I, O, E>(PhantomData<fn(I) -> Result<O, E>>);
/// Marker of [`supply`] steps.
pub struct Supply<I, O>(PhantomData<fn(I) -> O>);
/// Marker of [`consume`] steps.
pub struct Consume<I>(PhantomData<fn(I)>);
/// Marker of [`run`] steps.
pub struct Effect<I>(PhantomData<fn(I)>);

/// A step executing a function. `M` selects how the function is called.
pub struct CodeExecution<F, M> {
    f: F,
    name: Cow<'static, str>,
    _mode: PhantomData<M>,
}

impl<F, M> CodeExecution<F, M> {
    fn new(f: F, name: &'static str) -> Self {
        Self {
            f,
            name: Cow::Borrowed(name),
            _mode: PhantomData,
        }
    }

    /// Sets the name used in logs and errors.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }
}

impl<F, M> fmt::Debug for CodeExecution<F, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeExecution")
            .field("name", &self.name)
            .finish()
    }
}

/// Maps the input to an output.
pub fn apply<I, O, F>(f: F) -> CodeExecution<F, Apply<I, O>>
where
    F: Fn(I) -> O + Send + Sync + 'static,
{
    CodeExecution::new(f, "apply")
}

/// Maps the input to an output or fails the continuation with
/// [`CoroutineError::StepFailure`].
pub fn try_apply<I, O, E, F>(f: F) -> CodeExecution<F, TryApply<I, O, E>>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: Into<Box<dyn Error + Send + Sync + 'static>>,
{
    CodeExecution::new(f, "try_apply")
}

/// Ignores the input and produces a new value.
pub fn supply<I, O, F>(f: F) -> CodeExecution<F, Supply<I, O>>
where
    F: Fn() -> O + Send + Sync + 'static,
{
    CodeExecution::new(f, "supply")
}

/// Consumes the input.
pub fn consume<I, F>(f: F) -> CodeExecution<F, Consume<I>>
where
    F: Fn(I) + Send + Sync + 'static,
{
    CodeExecution::new(f, "consume")
}

/// Ignores the input and runs `f` for its side effects.
pub fn run<I, F>(f: F) -> CodeExecution<F, Effect<I>>
where
    F: Fn() + Send + Sync + 'static,
{
    CodeExecution::new(f, "run")
}

impl<F, I, O> Step<I, O> for CodeExecution<F, Apply<I, O>>
where
    F: Fn(I) -> O + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    fn execute(&self, input: I, _: Suspension<O>) -> Result<Execution<O>, CoroutineError> {
        Ok(Execution::Complete((self.f)(input)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F, I, O, E> Step<I, O> for CodeExecution<F, TryApply<I, O, E>>
where
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
    E: Into<Box<dyn Error + Send + Sync + 'static>> + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    fn execute(&self, input: I, _: Suspension<O>) -> Result<Execution<O>, CoroutineError> {
        (self.f)(input)
            .map(Execution::Complete)
            .map_err(|e| CoroutineError::step_failure(self.name.as_ref(), e))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F, I, O> Step<I, O> for CodeExecution<F, Supply<I, O>>
where
    F: Fn() -> O + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
    fn execute(&self, _: I, _: Suspension<O>) -> Result<Execution<O>, CoroutineError> {
        Ok(Execution::Complete((self.f)()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F, I> Step<I, ()> for CodeExecution<F, Consume<I>>
where
    F: Fn(I) + Send + Sync + 'static,
    I: Send + 'static,
{
    fn execute(&self, input: I, _: Suspension<()>) -> Result<Execution<()>, CoroutineError> {
        (self.f)(input);
        Ok(Execution::Complete(()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F, I> Step<I, ()> for CodeExecution<F, Effect<I>>
where
    F: Fn() + Send + Sync + 'static,
    I: Send + 'static,
{
    fn execute(&self, _: I, _: Suspension<()>) -> Result<Execution<()>, CoroutineError> {
        (self.f)();
        Ok(Execution::Complete(()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
