//! Monitoring Module
//!
//! Timing utilities for benchmark runs. Per-scope counters live in
//! [`ScopeSummary`](crate::execution::ScopeSummary).
//!
//! # Components
//!
//! - [`Profiler`]: Labelled measurements and a bar chart summary

pub mod profiler;

pub use profiler::{Measurement, Profiler};
