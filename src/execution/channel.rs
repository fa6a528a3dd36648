//! Socket Channels
//!
//! Non-blocking TCP channels driven by the event loop's readiness
//! notifications, and the per-continuation table that lets consecutive
//! socket steps talk over the same connection.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Remote address of a socket step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint; the host is resolved when the channel opens.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().trim().to_string(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = String;

    /// Parses `host:port` (IPv6 hosts in brackets).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| format!("Missing port in endpoint '{}'", s))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("Missing host in endpoint '{}'", s));
        }

        let port = port
            .parse()
            .map_err(|_| format!("Invalid port in endpoint '{}'", s))?;

        Ok(Self::new(host, port))
    }
}

/// Counters of the event loop's channel activity.
#[derive(Debug, Default)]
pub struct IoStats {
    open: AtomicUsize,
    opened: AtomicU64,
    transfers: AtomicU64,
    timeouts: AtomicU64,
}

impl IoStats {
    /// Channels currently open.
    pub fn open_channels(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Channels opened since the event loop started.
    pub fn opened_channels(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Completed transfers.
    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    /// Suspensions that hit their deadline.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub(crate) fn record_transfer(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

/// An open connection to an endpoint.
///
/// Transfers wait for readiness and then use non-blocking `try_*` calls,
/// re-arming interest whenever the socket would block.
pub struct Channel {
    stream: TcpStream,
    endpoint: Endpoint,
    stats: Arc<IoStats>,
}

impl Channel {
    pub(crate) async fn connect(endpoint: &Endpoint, stats: Arc<IoStats>) -> io::Result<Self> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        stream.set_nodelay(true)?;

        stats.open.fetch_add(1, Ordering::AcqRel);
        stats.opened.fetch_add(1, Ordering::Relaxed);
        trace!("Opened channel to {}", endpoint);

        Ok(Self {
            stream,
            endpoint: endpoint.clone(),
            stats,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Writes all of `data`.
    pub(crate) async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;

        while written < data.len() {
            self.stream.writable().await?;

            match self.stream.try_write(&data[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "channel closed while sending",
                    ))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Reads whatever is available into `buf`; `Ok(0)` means the peer
    /// closed the connection.
    pub(crate) async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;

            match self.stream.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.stats.open.fetch_sub(1, Ordering::AcqRel);
        trace!("Closed channel to {}", self.endpoint);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Default)]
struct TableInner {
    channels: HashMap<Endpoint, Channel>,
    closed: bool,
}

/// Channels owned by one continuation, keyed by endpoint.
///
/// A channel is checked out for the duration of a transfer and returned
/// afterwards. Once the continuation finishes the table is closed, every
/// channel in it, or returned to it later, is dropped, and transfers still
/// holding a checked-out channel are told to stop.
pub struct ChannelTable {
    inner: Mutex<TableInner>,
    closed: watch::Sender<bool>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTable {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Mutex::new(TableInner::default()),
            closed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the open channel to `endpoint` or connects a new one.
    pub(crate) async fn checkout(
        &self,
        endpoint: &Endpoint,
        stats: &Arc<IoStats>,
    ) -> io::Result<Channel> {
        let existing = self.lock().channels.remove(endpoint);
        match existing {
            Some(channel) => Ok(channel),
            None => Channel::connect(endpoint, Arc::clone(stats)).await,
        }
    }

    /// Returns a channel after a transfer.
    pub(crate) fn put_back(&self, channel: Channel) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.channels.insert(channel.endpoint.clone(), channel);
    }

    /// Drops every channel and refuses later returns.
    pub(crate) fn clear(&self) {
        let drained: Vec<Channel> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.channels.drain().map(|(_, c)| c).collect()
        };
        drop(drained);
        self.closed.send_replace(true);
    }

    /// Signal that flips to `true` once the table is closed.
    pub(crate) fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Number of idle channels in the table.
    pub fn len(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
