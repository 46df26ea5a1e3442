//! Loopback entry point for tunnelled connections
//!
//! The listener binds `127.0.0.1:0`. Every accepted client gets its own freshly built
//! [`TunnelChain`](super::TunnelChain); once the chain is up, bytes are copied in both
//! directions until either side closes. The driver dials the listener and never knows a
//! tunnel exists.

use super::chain::{TunnelChain, TunnelPlan};
use super::service::{SocketCounter, Tracked, TunnelStream};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Client bytes held while the chain is still dialling
const EARLY_DATA_LIMIT: usize = 64 * 1024;

struct Shared {
    plan: TunnelPlan,
    sockets: SocketCounter,
    root: CancellationToken,
    sessions: Mutex<CancellationToken>,
    first_error: Mutex<Option<Error>>,
}

impl Shared {
    fn record(&self, err: Error) {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

/// Ephemeral loopback listener feeding a [`TunnelPlan`]
pub struct LocalListener {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for LocalListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalListener")
            .field("local_addr", &self.local_addr)
            .field("hops", &self.shared.plan.hops().len())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl LocalListener {
    /// Bind a loopback port and start accepting
    pub async fn start(plan: TunnelPlan) -> Result<Self> {
        Self::start_with_counter(plan, SocketCounter::new()).await
    }

    /// Like [`LocalListener::start`], reporting sockets to an existing counter
    pub async fn start_with_counter(plan: TunnelPlan, sockets: SocketCounter) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;

        let root = CancellationToken::new();
        let shared = Arc::new(Shared {
            plan,
            sockets,
            sessions: Mutex::new(root.child_token()),
            root,
            first_error: Mutex::new(None),
        });

        let span = tracing::debug_span!("tunnel_listener", %local_addr);
        let task = tokio::spawn(accept_loop(listener, shared.clone()).instrument(span));
        tracing::debug!(%local_addr, target = %shared.plan.target(), "tunnel listener started");

        Ok(Self {
            local_addr,
            shared,
            task: Mutex::new(Some(task)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Bound loopback address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound loopback port
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Sockets currently open by the listener and its chains
    pub fn open_sockets(&self) -> usize {
        self.shared.sockets.get()
    }

    /// First tunnel error recorded since the last call
    pub fn take_error(&self) -> Option<Error> {
        self.shared.first_error.lock().take()
    }

    /// First tunnel error recorded, left in place
    pub fn last_error(&self) -> Option<Error> {
        self.shared.first_error.lock().clone()
    }

    /// Tear down every in-flight client session but keep accepting
    pub fn drop_sessions(&self) {
        let mut sessions = self.shared.sessions.lock();
        sessions.cancel();
        *sessions = self.shared.root.child_token();
    }

    /// Close the listening socket and every session. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.root.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        tracing::debug!(local_addr = %self.local_addr, "tunnel listener stopped");
    }

    /// Whether `stop` was called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.root.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    crate::metrics::counters::listener_accepted();
                    let token = shared.sessions.lock().clone();
                    let shared = shared.clone();
                    tokio::spawn(
                        serve(socket, shared, token)
                            .instrument(tracing::debug_span!("tunnel_session", %peer)),
                    );
                }
                Err(e) => {
                    tracing::warn!("tunnel listener accept failed: {}", e);
                }
            },
        }
    }
}

/// Dial the chain while watching the client.
///
/// A client that hangs up before the chain is ready ends the session, even if it was
/// accepted after `drop_sessions`. Bytes it sends meanwhile are replayed upstream.
async fn open_upstream(
    chain: &TunnelChain,
    client: &mut Tracked<TcpStream>,
) -> Result<Option<TunnelStream>> {
    let connect = chain.connect();
    tokio::pin!(connect);

    let mut early = Vec::new();
    let mut buf = [0u8; 4096];
    let mut upstream = loop {
        tokio::select! {
            result = &mut connect => break result?,
            read = client.read(&mut buf), if early.len() < EARLY_DATA_LIMIT => match read {
                Ok(0) | Err(_) => return Ok(None),
                Ok(n) => early.extend_from_slice(&buf[..n]),
            },
        }
    };
    if !early.is_empty() {
        upstream.write_all(&early).await?;
    }
    Ok(Some(upstream))
}

async fn serve(socket: TcpStream, shared: Arc<Shared>, token: CancellationToken) {
    socket.set_nodelay(true).ok();
    let mut client = shared.sockets.track(socket);
    let chain = shared.plan.build(shared.sockets.clone());

    let outcome = tokio::select! {
        _ = token.cancelled() => None,
        result = async {
            let Some(mut upstream) = open_upstream(&chain, &mut client).await? else {
                return Ok(None);
            };
            tokio::io::copy_bidirectional(&mut client, &mut upstream)
                .await
                .map(Some)
                .map_err(Error::from)
        } => Some(result),
    };
    chain.stop();

    match outcome {
        Some(Ok(Some((sent, received)))) => {
            tracing::debug!(sent, received, "tunnel session closed");
        }
        Some(Ok(None)) => tracing::debug!("client left before the tunnel was up"),
        Some(Err(e)) if e.is_tunnel_error() => {
            tracing::debug!("tunnel session failed: {}", e);
            shared.record(e);
        }
        Some(Err(e)) => tracing::debug!("tunnel session ended: {}", e),
        None => tracing::debug!("tunnel session dropped"),
    }
    // The error is recorded before the client sees its socket close.
    drop(client);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{Endpoint, HopConfig, ProxyConfig};
    use std::time::Duration;

    fn unreachable_plan(port: u16) -> TunnelPlan {
        TunnelPlan::new(Endpoint::new("db.internal", 5432))
            .hop(HopConfig::Socks(ProxyConfig::new("127.0.0.1", port)))
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_binds_loopback_ephemeral_port() {
        let listener = LocalListener::start(unreachable_plan(1)).await.unwrap();
        assert!(listener.local_addr().ip().is_loopback());
        assert_ne!(listener.port(), 0);
        listener.stop();
        listener.stop();
        assert!(listener.is_stopped());
    }

    #[tokio::test]
    async fn test_records_first_tunnel_error() {
        let listener = LocalListener::start(unreachable_plan(closed_port().await))
            .await
            .unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        let err = listener.take_error().expect("tunnel error recorded");
        assert!(matches!(err, Error::ProxyConnect { .. }), "got {:?}", err);
        assert!(listener.take_error().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.open_sockets(), 0);
    }

    /// Accepts and holds connections; counts the ones still open
    async fn stalling_proxy() -> (u16, Arc<std::sync::atomic::AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let open = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = open.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let counter = counter.clone();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        (port, open)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_client_hangup_abandons_pending_chain() {
        let (proxy_port, proxy_open) = stalling_proxy().await;
        let listener = LocalListener::start(unreachable_plan(proxy_port)).await.unwrap();

        // The client lands on the token installed here, which nothing cancels.
        listener.drop_sessions();
        let client = TcpStream::connect(listener.local_addr()).await.unwrap();
        assert!(wait_until(|| proxy_open.load(Ordering::SeqCst) == 1).await);

        drop(client);
        assert!(wait_until(|| proxy_open.load(Ordering::SeqCst) == 0).await);
        assert!(wait_until(|| listener.open_sockets() == 0).await);
        assert!(listener.last_error().is_none());
    }

    #[tokio::test]
    async fn test_stop_closes_listening_socket() {
        let listener = LocalListener::start(unreachable_plan(1)).await.unwrap();
        let addr = listener.local_addr();
        listener.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
