//! Corunner - Cooperative Coroutine Runner
//!
//! Composable pipelines ("coroutines") of small steps, executed under a
//! supervising scope either on the calling thread or asynchronously across
//! a shared worker pool and a non-blocking I/O event loop.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`coroutine`]: Steps, type-checked composition and continuations
//! - [`execution`]: Scope supervisor, worker pool, event loop and channels
//! - [`steps`]: Ready-made code and socket steps
//! - [`monitoring`]: Profiling of benchmark runs
//!
//! # Example
//!
//! ```rust
//! use corunner::{first, launch};
//! use corunner::steps::{apply, try_apply};
//!
//! let parse = first(try_apply(|s: String| s.trim().parse::<u32>()))
//!     .then(apply(|n: u32| n * 2));
//!
//! let summary = launch(|run| {
//!     // Blocking: runs on this thread, returns when finished
//!     let doubled = run.blocking(&parse, " 21 ".to_string()).into_result();
//!     assert_eq!(doubled.unwrap(), 42);
//!
//!     // Async: runs on the worker pool, launch waits for it
//!     run.spawn(&parse, "7".to_string());
//! })
//! .unwrap();
//!
//! assert_eq!(summary.completed, 2);
//! ```

pub mod coroutine;
pub mod execution;
pub mod monitoring;
pub mod steps;

// Re-export commonly used types
pub use coroutine::{first, Continuation, ContinuationState, Coroutine, CoroutineError, Step};
pub use execution::config::ScopeConfig;
pub use execution::scope::{launch, launch_with, Run, ScopeError, ScopeSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Corunner";
