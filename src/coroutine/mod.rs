//! Coroutine Definition Module
//!
//! Provides the building blocks of a pipeline and the per-invocation
//! record that executes it.
//!
//! # Structure
//!
//! - [`step`]: The step contract (execute or suspend)
//! - [`chain`]: Type-checked composition of steps into coroutines
//! - [`continuation`]: Per-invocation cursor, state machine and result slot
//! - [`error`]: Error taxonomy

pub mod chain;
pub mod continuation;
pub mod error;
pub mod step;

pub use chain::{first, AnyStep, Coroutine};
pub use continuation::{Continuation, ContinuationId, ContinuationState};
pub use error::{CoroutineError, ErrorKind};
pub use step::{Execution, Resume, Step, Suspended, Suspension};
