//! Execution Module
//!
//! Runs coroutines under a supervising scope.
//!
//! # Architecture
//!
//! - [`scope`]: Scope supervisor, the `Run` invocation context and `launch`
//! - [`pool`]: Work-stealing worker pool for async continuations
//! - [`event_loop`]: Readiness-driven I/O threads for socket steps
//! - [`channel`]: TCP channels and per-continuation channel tables
//! - [`config`]: Scope configuration

pub mod channel;
pub mod config;
pub mod event_loop;
pub mod pool;
pub mod scope;

pub use channel::Endpoint;
pub use config::{ConfigError, ScopeConfig};
pub use event_loop::{EventLoop, IoContext};
pub use pool::WorkerPool;
pub use scope::{launch, launch_with, Diagnostic, Run, ScopeError, ScopeSummary};
