//! Profiler
//!
//! Records labelled wall-clock measurements for benchmark runs and renders
//! them as a bar chart:
//!
//! ```text
//! Parallel Execution
//!
//! 1000 threads | ##################################       | (412 ms)
//! 1000 spawns  | ###                                      | (37 ms)
//!
//! Total: 449 ms
//! ```

use std::time::{Duration, Instant};

const BAR_WIDTH: usize = 40;
const LABEL_WIDTH: usize = 16;

/// One labelled measurement.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub label: String,
    pub duration: Duration,
}

/// Measures consecutive phases of a run.
#[derive(Debug, Clone)]
pub struct Profiler {
    title: String,
    started: Instant,
    last: Instant,
    measurements: Vec<Measurement>,
}

impl Profiler {
    /// Starts profiling now.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            title: title.into(),
            started: now,
            last: now,
            measurements: Vec::new(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Records the time since the previous measurement (or since the start)
    /// under `label` and returns it.
    pub fn measure(&mut self, label: impl Into<String>) -> Duration {
        let now = Instant::now();
        let duration = now.duration_since(self.last);
        self.last = now;

        self.measurements.push(Measurement {
            label: label.into(),
            duration,
        });
        duration
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Sum of all measurements.
    pub fn total(&self) -> Duration {
        self.measurements.iter().map(|m| m.duration).sum()
    }

    /// Time since the profiler was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Renders the measurements, bars scaled to the longest one.
    pub fn summary(&self) -> String {
        let mut output = format!("\n{}\n\n", self.title);

        let longest = self
            .measurements
            .iter()
            .map(|m| m.duration)
            .max()
            .unwrap_or_default();

        for m in &self.measurements {
            let width = if longest.is_zero() {
                0
            } else {
                let scaled = m.duration.as_secs_f64() / longest.as_secs_f64() * BAR_WIDTH as f64;
                (scaled.round() as usize).clamp(1, BAR_WIDTH)
            };

            output.push_str(&format!(
                "{} |{}{}| ({} ms)\n",
                truncate(&m.label, LABEL_WIDTH),
                "#".repeat(width),
                " ".repeat(BAR_WIDTH - width),
                m.duration.as_millis()
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", self.total().as_millis()));
        output
    }

    /// Prints [`summary`](Self::summary) to stdout.
    pub fn print_summary(&self) {
        print!("{}", self.summary());
    }
}

/// Pads or shortens a label to exactly `width` characters.
fn truncate(s: &str, width: usize) -> String {
    let count = s.chars().count();
    if count <= width {
        format!("{:width$}", s, width = width)
    } else {
        let head: String = s.chars().take(width - 3).collect();
        format!("{}...", head)
    }
}
