//! I/O Event Loop
//!
//! A small tokio runtime owned by a scope. Socket steps suspend their
//! continuation and hand the transfer to the loop; when the transfer
//! completes, fails, times out or the scope is cancelled, the loop resumes
//! the continuation with the outcome.

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;

use super::channel::{ChannelTable, IoStats};
use crate::coroutine::{CoroutineError, Resume};

/// Time allowed for in-flight transfers to unwind at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Readiness-driven I/O threads of a scope.
pub struct EventLoop {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    cancel: watch::Sender<bool>,
    stats: Arc<IoStats>,
    threads: usize,
}

impl EventLoop {
    /// Starts `threads` I/O threads named `{name}-io`.
    pub fn start(threads: usize, name: &str) -> io::Result<Self> {
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name(format!("{}-io", name))
            .enable_io()
            .enable_time()
            .build()?;

        let handle = runtime.handle().clone();
        let (cancel, _) = watch::channel(false);

        debug!("Event loop '{}' started with {} threads", name, threads);

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            cancel,
            stats: Arc::new(IoStats::default()),
            threads,
        })
    }

    /// Number of I/O threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn stats(&self) -> &Arc<IoStats> {
        &self.stats
    }

    /// Channels currently open on this loop.
    pub fn open_channels(&self) -> usize {
        self.stats.open_channels()
    }

    /// Context handed to a step that wants to suspend on I/O.
    pub(crate) fn context(
        &self,
        channels: Arc<ChannelTable>,
        default_timeout: Option<Duration>,
    ) -> IoContext {
        IoContext {
            handle: self.handle.clone(),
            cancel: self.cancel.subscribe(),
            stats: Arc::clone(&self.stats),
            channels,
            default_timeout,
        }
    }

    /// Aborts every pending and future transfer with
    /// [`CoroutineError::ScopeCancelled`].
    pub fn cancel_all(&self) {
        if !self.cancel.send_replace(true) {
            debug!("Event loop cancelling pending transfers");
        }
    }

    /// Stops the I/O threads. Idempotent.
    pub fn shutdown(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
            let open = self.open_channels();
            if open > 0 {
                warn!("Event loop stopped with {} channels still open", open);
            }
            debug!(
                "Event loop stopped ({} channels opened, {} transfers, {} timeouts)",
                self.stats.opened_channels(),
                self.stats.transfers(),
                self.stats.timeouts()
            );
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A step's handle on the event loop.
///
/// Obtained through [`Suspension::io`](crate::coroutine::Suspension::io).
pub struct IoContext {
    handle: Handle,
    cancel: watch::Receiver<bool>,
    stats: Arc<IoStats>,
    channels: Arc<ChannelTable>,
    default_timeout: Option<Duration>,
}

impl IoContext {
    /// Deadline applied when a step does not set its own.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Channels of the continuation executing the step.
    pub fn channels(&self) -> &Arc<ChannelTable> {
        &self.channels
    }

    pub fn stats(&self) -> &Arc<IoStats> {
        &self.stats
    }

    /// Runs `transfer` on the event loop and resumes the continuation with
    /// its outcome.
    ///
    /// The transfer is abandoned with [`CoroutineError::SuspensionTimeout`]
    /// once `deadline` elapses and with [`CoroutineError::ScopeCancelled`]
    /// when the scope is cancelled or the continuation finishes. Abandoning
    /// drops the future and with it any channel it holds.
    pub fn submit<O, F>(
        self,
        step: impl Into<String>,
        deadline: Option<Duration>,
        resume: Resume<O>,
        transfer: F,
    ) where
        O: Send + 'static,
        F: Future<Output = Result<O, CoroutineError>> + Send + 'static,
    {
        let IoContext {
            handle,
            mut cancel,
            stats,
            channels,
            ..
        } = self;
        let mut released = channels.closed();
        drop(channels);
        let step = step.into();

        handle.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => Err(CoroutineError::ScopeCancelled),
                _ = cancelled(&mut released) => Err(CoroutineError::ScopeCancelled),
                result = with_deadline(&step, deadline, transfer) => result,
            };

            match outcome {
                Ok(value) => {
                    stats.record_transfer();
                    resume.resume(value);
                }
                Err(error) => {
                    if let CoroutineError::SuspensionTimeout { .. } = error {
                        stats.record_timeout();
                    }
                    trace!("Transfer of step '{}' ended with: {}", step, error);
                    resume.fail(error);
                }
            }
        });
    }
}

/// Resolves once `cancel` turns true. Never resolves if the sender is
/// gone: the loop's shutdown or the transfer itself ends the task then.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn with_deadline<O, F>(
    step: &str,
    deadline: Option<Duration>,
    transfer: F,
) -> Result<O, CoroutineError>
where
    F: Future<Output = Result<O, CoroutineError>>,
{
    match deadline {
        Some(after) => match tokio::time::timeout(after, transfer).await {
            Ok(result) => result,
            Err(_) => Err(CoroutineError::SuspensionTimeout {
                step: step.to_string(),
                after,
            }),
        },
        None => transfer.await,
    }
}
