//! Hop contract and shared bookkeeping
//!
//! Every hop implements [`TunnelService`]. [`HopState`] holds what all hops share:
//! a cancellation token fired by `stop()`, the first error seen, and a handle on the
//! socket counter so tests and the listener can observe that nothing leaks.

use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Byte stream produced by a hop
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed stream threaded from one hop into the next
pub type TunnelStream = Box<dyn AsyncStream>;

/// `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or IP literal (IPv6 without brackets)
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One hop of a tunnel chain.
///
/// `connect` receives the stream produced by the previous hop (or `None` for the
/// first hop, which dials its own server) and returns a stream that reaches `next`.
#[async_trait]
pub trait TunnelService: Send + Sync {
    /// Extend `inbound` one hop towards `next`
    async fn connect(&self, inbound: Option<TunnelStream>, next: &Endpoint) -> Result<TunnelStream>;

    /// Release every resource this hop opened, including pending connects. Idempotent.
    fn stop(&self);

    /// First error this hop recorded
    fn last_error(&self) -> Option<Error>;

    /// Whether an error has been recorded
    fn has_failed(&self) -> bool {
        self.last_error().is_some()
    }

    /// Server this hop talks to
    fn endpoint(&self) -> Endpoint;

    /// Address used in error messages (credentials sanitized)
    fn address(&self) -> String;
}

/// Counts live sockets across hops and listener sessions
#[derive(Debug, Clone, Default)]
pub struct SocketCounter(Arc<AtomicUsize>);

impl SocketCounter {
    /// New counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sockets currently open
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Wrap `stream` so it is counted until dropped
    pub fn track<S>(&self, stream: S) -> Tracked<S> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Tracked {
            inner: stream,
            counter: self.0.clone(),
        }
    }
}

/// Stream counted by a [`SocketCounter`]
#[derive(Debug)]
pub struct Tracked<S> {
    inner: S,
    counter: Arc<AtomicUsize>,
}

impl<S> Tracked<S> {
    /// Borrow the wrapped stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> Drop for Tracked<S> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Stream that fails every read and write once its token is cancelled.
///
/// Used for transports handed to tasks the hop does not own, which would otherwise keep
/// the socket open after `stop()`.
pub struct Cancellable<S> {
    inner: S,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> Cancellable<S> {
    /// Tie `stream` to `token`
    pub fn new(stream: S, token: CancellationToken) -> Self {
        Self {
            inner: stream,
            cancelled: Box::pin(token.cancelled_owned()),
        }
    }

    fn check(&mut self, cx: &mut Context<'_>) -> std::io::Result<()> {
        match self.cancelled.as_mut().poll(cx) {
            Poll::Ready(()) => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "tunnel stopped",
            )),
            Poll::Pending => Ok(()),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Cancellable<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.check(cx)?;
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Cancellable<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.check(cx)?;
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.check(cx)?;
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Bookkeeping shared by every hop implementation
#[derive(Debug)]
pub struct HopState {
    cancel: CancellationToken,
    sockets: SocketCounter,
    first_error: Mutex<Option<Error>>,
}

impl HopState {
    /// State reporting open sockets to `sockets`
    pub fn new(sockets: SocketCounter) -> Self {
        Self {
            cancel: CancellationToken::new(),
            sockets,
            first_error: Mutex::new(None),
        }
    }

    /// Count `stream` against this hop's counter
    pub fn track<S>(&self, stream: S) -> Tracked<S> {
        self.sockets.track(stream)
    }

    /// Store `err` if nothing was recorded yet, and hand it back
    pub fn record(&self, err: Error) -> Error {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(err.clone());
        }
        err
    }

    /// First recorded error
    pub fn last_error(&self) -> Option<Error> {
        self.first_error.lock().clone()
    }

    /// Fire the cancellation token
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether `stop` was called
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token observed by pending work
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Drive `work` until it completes or the hop is stopped.
    ///
    /// Errors from `work` are recorded; dropping `work` on stop closes whatever sockets
    /// it held. A stop is not recorded as a hop failure.
    pub async fn run<T, F>(&self, work: F, stopped: impl FnOnce() -> Error) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_stopped() {
            return Err(stopped());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(stopped()),
            result = work => result.map_err(|e| self.record(e)),
        }
    }
}
