//! Coroutine Composition
//!
//! A [`Coroutine`] is an immutable, ordered list of steps. Statically typed
//! composition goes through [`first`] and [`Coroutine::then`], where the
//! compiler enforces that each step consumes what the previous one
//! produces. Steps only known at run time are wrapped in [`AnyStep`] and
//! appended with [`Coroutine::try_then`], which checks the linkage when the
//! chain is built.

use std::any::{type_name, TypeId};
use std::fmt;
use std::iter;
use std::marker::PhantomData;
use std::sync::Arc;

use super::continuation::{Cursor, Value};
use super::error::CoroutineError;
use super::step::{Execution, Step, Suspension};

/// Object-safe view of a `Step<I, O>` operating on boxed values.
pub(crate) trait ErasedStep: Send + Sync {
    fn name(&self) -> &str;
    fn input_type(&self) -> TypeId;
    fn input_type_name(&self) -> &'static str;
    fn output_type(&self) -> TypeId;
    fn output_type_name(&self) -> &'static str;

    /// `Ok(Some(output))` on completion, `Ok(None)` when suspended.
    fn execute_erased(&self, input: Value, cursor: Cursor)
        -> Result<Option<Value>, CoroutineError>;
}

struct Typed<S, I, O> {
    step: S,
    _marker: PhantomData<fn(I) -> O>,
}

impl<S, I, O> ErasedStep for Typed<S, I, O>
where
    S: Step<I, O>,
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        self.step.name()
    }

    fn input_type(&self) -> TypeId {
        TypeId::of::<I>()
    }

    fn input_type_name(&self) -> &'static str {
        type_name::<I>()
    }

    fn output_type(&self) -> TypeId {
        TypeId::of::<O>()
    }

    fn output_type_name(&self) -> &'static str {
        type_name::<O>()
    }

    fn execute_erased(
        &self,
        input: Value,
        cursor: Cursor,
    ) -> Result<Option<Value>, CoroutineError> {
        let input = input
            .downcast::<I>()
            .map_err(|_| CoroutineError::Composition {
                step: self.step.name().to_string(),
                expected: type_name::<I>(),
                found: "<unknown>",
            })?;

        match self.step.execute(*input, Suspension::new(cursor))? {
            Execution::Complete(output) => Ok(Some(Box::new(output))),
            Execution::Suspended(_) => Ok(None),
        }
    }
}

fn erase<S, I, O>(step: S) -> Arc<dyn ErasedStep>
where
    S: Step<I, O>,
    I: Send + 'static,
    O: Send + 'static,
{
    Arc::new(Typed {
        step,
        _marker: PhantomData,
    })
}

pub(crate) type StepList = Arc<[Arc<dyn ErasedStep>]>;

/// A step whose input and output types are only known at run time.
#[derive(Clone)]
pub struct AnyStep {
    inner: Arc<dyn ErasedStep>,
}

impl AnyStep {
    /// Erases the types of `step`.
    pub fn new<S, I, O>(step: S) -> Self
    where
        S: Step<I, O>,
        I: Send + 'static,
        O: Send + 'static,
    {
        Self { inner: erase(step) }
    }

    /// Name of the wrapped step.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Name of the input type the step consumes.
    pub fn input_type_name(&self) -> &'static str {
        self.inner.input_type_name()
    }

    /// Name of the output type the step produces.
    pub fn output_type_name(&self) -> &'static str {
        self.inner.output_type_name()
    }

    fn check<I: 'static, O: 'static>(&self) -> Result<(), CoroutineError> {
        if self.inner.input_type() != TypeId::of::<I>() {
            return Err(CoroutineError::Composition {
                step: self.name().to_string(),
                expected: self.inner.input_type_name(),
                found: type_name::<I>(),
            });
        }
        if self.inner.output_type() != TypeId::of::<O>() {
            return Err(CoroutineError::Composition {
                step: self.name().to_string(),
                expected: type_name::<O>(),
                found: self.inner.output_type_name(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for AnyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyStep")
            .field("name", &self.name())
            .field("input", &self.input_type_name())
            .field("output", &self.output_type_name())
            .finish()
    }
}

/// An immutable chain of steps from `I` to `O`.
///
/// Cloning is cheap and clones share the step list, so one coroutine can
/// back any number of concurrent invocations.
///
/// # Example
///
/// ```
/// use corunner::coroutine::first;
/// use corunner::steps::apply;
///
/// let cr = first(apply(|s: String| s.len())).then(apply(|n: usize| n * 2));
/// assert_eq!(cr.step_count(), 2);
/// ```
pub struct Coroutine<I, O> {
    steps: StepList,
    _marker: PhantomData<fn(I) -> O>,
}

/// Builds a one-step coroutine.
pub fn first<I, O, S>(step: S) -> Coroutine<I, O>
where
    S: Step<I, O>,
    I: Send + 'static,
    O: Send + 'static,
{
    Coroutine::first(step)
}

impl<I, O> Coroutine<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Builds a one-step coroutine.
    pub fn first<S: Step<I, O>>(step: S) -> Self {
        Self {
            steps: Arc::from(vec![erase(step)]),
            _marker: PhantomData,
        }
    }

    /// Builds a one-step coroutine from a type-erased step.
    pub fn try_first(step: AnyStep) -> Result<Self, CoroutineError> {
        step.check::<I, O>()?;
        Ok(Self {
            steps: Arc::from(vec![step.inner]),
            _marker: PhantomData,
        })
    }

    /// Returns a new coroutine with `step` appended.
    pub fn then<O2, S>(&self, step: S) -> Coroutine<I, O2>
    where
        O2: Send + 'static,
        S: Step<O, O2>,
    {
        self.append(erase(step))
    }

    /// Returns a new coroutine with a type-erased step appended.
    ///
    /// Fails with [`CoroutineError::Composition`] if the step does not
    /// consume `O` or does not produce `O2`.
    pub fn try_then<O2>(&self, step: AnyStep) -> Result<Coroutine<I, O2>, CoroutineError>
    where
        O2: Send + 'static,
    {
        step.check::<O, O2>()?;
        Ok(self.append(step.inner))
    }

    fn append<O2>(&self, step: Arc<dyn ErasedStep>) -> Coroutine<I, O2> {
        let steps: Vec<_> = self.steps.iter().cloned().chain(iter::once(step)).collect();
        Coroutine {
            steps: Arc::from(steps),
            _marker: PhantomData,
        }
    }

    /// Number of steps in the chain.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Names of the steps in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub(crate) fn steps(&self) -> &StepList {
        &self.steps
    }
}

impl<I, O> Clone for Coroutine<I, O> {
    fn clone(&self) -> Self {
        Self {
            steps: Arc::clone(&self.steps),
            _marker: PhantomData,
        }
    }
}

impl<I, O> fmt::Debug for Coroutine<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("Coroutine")
            .field("input", &type_name::<I>())
            .field("output", &type_name::<O>())
            .field("steps", &names)
            .finish()
    }
}
