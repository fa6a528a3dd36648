//! Socket Steps
//!
//! [`send_to`] and [`receive_from`] suspend their continuation and let the
//! scope's event loop perform the transfer. Both operate on a
//! [`ByteBuffer`] that moves through the chain by value, and both reuse the
//! continuation's open channel to the same endpoint, so
//!
//! ```no_run
//! use corunner::{first, launch};
//! use corunner::steps::{receive_from, send_to, ByteBuffer, Endpoint};
//!
//! let server = Endpoint::new("example.com", 80);
//! let cr = first(send_to(server.clone())).then(receive_from(server));
//!
//! launch(|run| {
//!     let request = b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n";
//!     let mut data = ByteBuffer::with_capacity(100_000);
//!     data.put(request);
//!
//!     let reply = run.blocking(&cr, data).into_result();
//! })
//! .unwrap();
//! ```
//!
//! talks to the server over a single connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::buffer::ByteBuffer;
use crate::coroutine::{CoroutineError, Execution, Step, Suspension};
use crate::execution::channel::Endpoint;

/// Condition ending a receive before the buffer is full.
pub type ReceivePredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Sends the buffer's content to `endpoint`.
pub fn send_to(endpoint: Endpoint) -> SocketSend {
    SocketSend {
        name: format!("send_to({})", endpoint),
        endpoint,
        timeout: None,
    }
}

/// Receives from `endpoint` into the buffer's spare capacity.
pub fn receive_from(endpoint: Endpoint) -> SocketReceive {
    SocketReceive {
        name: format!("receive_from({})", endpoint),
        endpoint,
        timeout: None,
        until: None,
    }
}

/// Step writing every filled byte of the buffer, then emptying it.
#[derive(Debug, Clone)]
pub struct SocketSend {
    endpoint: Endpoint,
    timeout: Option<Duration>,
    name: String,
}

impl SocketSend {
    /// Fails the step with [`CoroutineError::SuspensionTimeout`] if the
    /// transfer has not finished after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Step<ByteBuffer, ByteBuffer> for SocketSend {
    fn execute(
        &self,
        mut buffer: ByteBuffer,
        suspension: Suspension<ByteBuffer>,
    ) -> Result<Execution<ByteBuffer>, CoroutineError> {
        let io = suspension.io()?;
        let deadline = self.timeout.or(io.default_timeout());
        let channels = Arc::clone(io.channels());
        let stats = Arc::clone(io.stats());
        let endpoint = self.endpoint.clone();
        let step = self.name.clone();

        let (resume, suspended) = suspension.suspend();

        io.submit(self.name.clone(), deadline, resume, async move {
            let mut channel = channels
                .checkout(&endpoint, &stats)
                .await
                .map_err(|e| CoroutineError::io(&step, e))?;

            channel
                .write_all(buffer.as_slice())
                .await
                .map_err(|e| CoroutineError::io(&step, e))?;

            buffer.clear();
            channels.put_back(channel);
            Ok(buffer)
        });

        Ok(Execution::Suspended(suspended))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Step appending received bytes until the buffer is full, the peer closes
/// the connection or the optional predicate holds.
#[derive(Clone)]
pub struct SocketReceive {
    endpoint: Endpoint,
    timeout: Option<Duration>,
    until: Option<ReceivePredicate>,
    name: String,
}

impl SocketReceive {
    /// Fails the step with [`CoroutineError::SuspensionTimeout`] if the
    /// transfer has not finished after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Completes the receive as soon as `predicate` holds for the filled
    /// bytes.
    pub fn until<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.until = Some(Arc::new(predicate));
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl fmt::Debug for SocketReceive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketReceive")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("until", &self.until.is_some())
            .finish()
    }
}

impl Step<ByteBuffer, ByteBuffer> for SocketReceive {
    fn execute(
        &self,
        mut buffer: ByteBuffer,
        suspension: Suspension<ByteBuffer>,
    ) -> Result<Execution<ByteBuffer>, CoroutineError> {
        let io = suspension.io()?;
        let deadline = self.timeout.or(io.default_timeout());
        let channels = Arc::clone(io.channels());
        let stats = Arc::clone(io.stats());
        let endpoint = self.endpoint.clone();
        let until = self.until.clone();
        let step = self.name.clone();

        let (resume, suspended) = suspension.suspend();

        io.submit(self.name.clone(), deadline, resume, async move {
            let done = |buffer: &ByteBuffer| {
                buffer.is_full() || until.as_ref().map_or(false, |p| p(buffer.as_slice()))
            };

            let mut channel = channels
                .checkout(&endpoint, &stats)
                .await
                .map_err(|e| CoroutineError::io(&step, e))?;

            while !done(&buffer) {
                let n = channel
                    .read_some(buffer.spare_mut())
                    .await
                    .map_err(|e| CoroutineError::io(&step, e))?;

                if n == 0 {
                    // Peer closed; the channel is spent.
                    return Ok(buffer);
                }
                buffer.advance(n);
            }

            channels.put_back(channel);
            Ok(buffer)
        });

        Ok(Execution::Suspended(suspended))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::{first, ContinuationState, Coroutine, ErrorKind};
    use crate::execution::config::ScopeConfig;
    use crate::execution::scope::{launch, launch_with};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    /// Echoes everything back, serving `connections` clients one after
    /// another.
    fn echo_server(connections: usize) -> (Endpoint, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());

        let handle = thread::spawn(move || {
            for _ in 0..connections {
                let (mut socket, _) = listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        (endpoint, handle)
    }

    /// A listener that never accepts: connects succeed, nothing is ever
    /// readable.
    fn silent_server() -> (Endpoint, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());
        (endpoint, listener)
    }

    fn ping() -> ByteBuffer {
        let mut data = ByteBuffer::with_capacity(4);
        data.put(b"PING");
        data
    }

    fn ping_pong(endpoint: &Endpoint) -> Coroutine<ByteBuffer, ByteBuffer> {
        first(send_to(endpoint.clone())).then(receive_from(endpoint.clone()))
    }

    #[test]
    fn test_round_trip_blocking_and_spawn() {
        let (endpoint, server) = echo_server(2);
        let cr = ping_pong(&endpoint);
        let (tx, rx) = mpsc::channel();

        let summary = launch(|run| {
            let reply = run.blocking(&cr, ping()).into_result().unwrap();
            assert_eq!(reply.as_slice(), b"PING");

            tx.send(run.spawn(&cr, ping())).unwrap();
        })
        .unwrap();

        let reply = rx.recv().unwrap().into_result().unwrap();
        assert_eq!(reply.as_slice(), b"PING");

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.io_threads, 1);
        assert_eq!(summary.open_channels, 0);
        server.join().unwrap();
    }

    #[test]
    fn test_receive_until_predicate() {
        let (endpoint, server) = echo_server(1);
        let cr = first(send_to(endpoint.clone()))
            .then(receive_from(endpoint.clone()).until(|bytes| bytes.ends_with(b"\n")));

        launch(|run| {
            let mut data = ByteBuffer::with_capacity(1024);
            data.put(b"hello\n");

            let reply = run.blocking(&cr, data).into_result().unwrap();
            assert_eq!(reply.to_string_lossy(), "hello\n");
            assert_eq!(reply.capacity(), 1024);
        })
        .unwrap();

        server.join().unwrap();
    }

    #[test]
    fn test_receive_times_out() {
        let (endpoint, _listener) = silent_server();
        let cr = first(receive_from(endpoint).with_timeout(Duration::from_millis(50)));

        let started = Instant::now();
        launch(|run| {
            let err = run
                .blocking(&cr, ByteBuffer::with_capacity(16))
                .into_result()
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SuspensionTimeout);
            assert!(err.is_step_failure());
        })
        .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_default_timeout_from_config() {
        let (endpoint, _listener) = silent_server();
        let cr = first(receive_from(endpoint));
        let config = ScopeConfig::new().with_io_timeout(Duration::from_millis(50));

        launch_with(config, |run| {
            let err = run
                .blocking(&cr, ByteBuffer::with_capacity(16))
                .into_result()
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SuspensionTimeout);
        })
        .unwrap();
    }

    #[test]
    fn test_connection_refused_is_step_failure() {
        let endpoint = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            Endpoint::from(listener.local_addr().unwrap())
        };
        let cr = first(send_to(endpoint));

        let err = launch(|run| {
            run.spawn(&cr, ping());
        })
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StepFailure);
        assert!(err.to_string().contains("send_to(127.0.0.1:"));
    }

    #[test]
    fn test_cancel_releases_channels() {
        let (endpoint, _listener) = silent_server();
        let cr = first(receive_from(endpoint)).then(apply_len());

        let err = launch(|run| {
            for _ in 0..100 {
                run.spawn(&cr, ByteBuffer::with_capacity(16));
            }

            let deadline = Instant::now() + Duration::from_secs(10);
            while run.open_channels() < 100 {
                assert!(Instant::now() < deadline, "channels not opened in time");
                thread::sleep(Duration::from_millis(1));
            }

            run.cancel();
        })
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ScopeCancelled);
        assert_eq!(err.summary.completed, 0);
        assert_eq!(err.summary.cancelled, 100);
        assert_eq!(err.summary.open_channels, 0);
    }

    #[test]
    fn test_cancel_one_releases_its_channel() {
        let (endpoint, _listener) = silent_server();
        let cr = first(receive_from(endpoint)).then(apply_len());

        let summary = launch(|run| {
            let continuation = run.spawn(&cr, ByteBuffer::with_capacity(16));

            let deadline = Instant::now() + Duration::from_secs(10);
            while run.open_channels() < 1 {
                assert!(Instant::now() < deadline, "channel not opened in time");
                thread::sleep(Duration::from_millis(1));
            }

            continuation.cancel();
            assert_eq!(continuation.state(), ContinuationState::Cancelled);

            let deadline = Instant::now() + Duration::from_secs(5);
            while run.open_channels() > 0 {
                assert!(Instant::now() < deadline, "channel still open after cancel");
                thread::sleep(Duration::from_millis(1));
            }
            assert!(!run.is_cancelled());
        })
        .unwrap();

        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.open_channels, 0);
    }

    #[test]
    fn test_spawned_receive_timeout_fails_scope() {
        let (endpoint, _listener) = silent_server();
        let cr = first(receive_from(endpoint).with_timeout(Duration::from_millis(50)));

        let err = launch(|run| {
            run.spawn(&cr, ByteBuffer::with_capacity(16));
        })
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SuspensionTimeout);
        assert_eq!(err.summary.failed, 1);
        assert_eq!(err.summary.open_channels, 0);
        assert!(err.to_string().contains("receive_from(127.0.0.1:"));
    }

    fn apply_len() -> impl Step<ByteBuffer, usize> {
        crate::steps::apply(|b: ByteBuffer| b.len())
    }

    #[test]
    fn test_step_names() {
        let endpoint = Endpoint::new("localhost", 7);
        assert_eq!(send_to(endpoint.clone()).name(), "send_to(localhost:7)");
        assert_eq!(
            receive_from(endpoint).named("reply").name(),
            "reply"
        );
    }
}
