//! Coroutine Errors
//!
//! Every failure a continuation can end with is a [`CoroutineError`].
//! The enum is `Clone` so the same error can be handed to the caller,
//! stored in the scope's aggregation slot and kept in its diagnostics.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Shared, cloneable error source.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Errors produced while composing or running coroutines.
#[derive(Debug, Clone, Error)]
pub enum CoroutineError {
    /// A type-erased step was appended to a chain whose output type does
    /// not match the step's input type (or the requested output type).
    #[error("cannot chain step '{step}': expected {expected}, found {found}")]
    Composition {
        step: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A step body failed. Remaining steps never execute.
    #[error("step '{step}' failed: {source}")]
    StepFailure {
        step: String,
        #[source]
        source: SharedError,
    },

    /// A suspended step saw no readiness before its deadline.
    #[error("step '{step}' timed out after {after:?}")]
    SuspensionTimeout { step: String, after: Duration },

    /// The owning scope was cancelled before the pipeline finished.
    #[error("scope cancelled")]
    ScopeCancelled,

    /// Worker pool or event loop threads could not be started.
    #[error("failed to start scheduler: {source}")]
    Scheduler {
        #[source]
        source: Arc<io::Error>,
    },

    /// The scope configuration was rejected.
    #[error("invalid scope configuration: {0}")]
    InvalidConfig(String),
}

/// Coarse classification of a [`CoroutineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Composition,
    StepFailure,
    SuspensionTimeout,
    ScopeCancelled,
    Scheduler,
    InvalidConfig,
}

impl CoroutineError {
    /// Wraps any error raised by the step named `step`.
    pub fn step_failure<E>(step: impl Into<String>, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::StepFailure {
            step: step.into(),
            source: Arc::from(error.into()),
        }
    }

    /// Wraps an I/O error raised by the step named `step`.
    pub fn io(step: impl Into<String>, error: io::Error) -> Self {
        Self::step_failure(step, error)
    }

    pub(crate) fn scheduler(error: io::Error) -> Self {
        Self::Scheduler {
            source: Arc::new(error),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Composition { .. } => ErrorKind::Composition,
            Self::StepFailure { .. } => ErrorKind::StepFailure,
            Self::SuspensionTimeout { .. } => ErrorKind::SuspensionTimeout,
            Self::ScopeCancelled => ErrorKind::ScopeCancelled,
            Self::Scheduler { .. } => ErrorKind::Scheduler,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    /// True for failures of a step body, timeouts included.
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self,
            Self::StepFailure { .. } | Self::SuspensionTimeout { .. }
        )
    }

    /// True if the error only reports cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::ScopeCancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failure_from_string() {
        let err = CoroutineError::step_failure("parse", "bad input");
        assert_eq!(err.kind(), ErrorKind::StepFailure);
        assert_eq!(err.to_string(), "step 'parse' failed: bad input");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_timeout_is_step_failure() {
        let err = CoroutineError::SuspensionTimeout {
            step: "receive".to_string(),
            after: Duration::from_millis(50),
        };
        assert!(err.is_step_failure());
        assert!(!err.is_cancellation());
        assert!(err.to_string().contains("50ms"));
    }

    #[test]
    fn test_cancellation_is_not_step_failure() {
        let err = CoroutineError::ScopeCancelled;
        assert!(err.is_cancellation());
        assert!(!err.is_step_failure());
        assert_eq!(err.kind(), ErrorKind::ScopeCancelled);
    }

    #[test]
    fn test_io_error_keeps_source() {
        let err = CoroutineError::io(
            "send",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        let cloned = err.clone();
        assert_eq!(cloned.kind(), ErrorKind::StepFailure);
        assert!(cloned.to_string().contains("refused"));
    }

    #[test]
    fn test_composition_message() {
        let err = CoroutineError::Composition {
            step: "len".to_string(),
            expected: "alloc::string::String",
            found: "i32",
        };
        assert_eq!(err.kind(), ErrorKind::Composition);
        assert!(err.to_string().contains("cannot chain step 'len'"));
    }
}
