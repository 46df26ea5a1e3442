//! In-process loopback servers shared by the integration tests

#![allow(dead_code)]

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Unencrypted OpenSSH ed25519 key, only ever used against fake servers
pub const SSH_TEST_KEY: &str = include_str!("../fixtures/ssh_ed25519");

/// Only user [`spawn_ssh`] lets in
pub const SSH_USER: &str = "deploy";

/// User whose public-key check never completes
pub const SSH_STALLED_USER: &str = "slowpoke";

/// Only `direct-tcpip` destination [`spawn_ssh`] opens
pub const SSH_FORWARDABLE_HOST: &str = "db.internal";

/// What the fake SOCKS5 proxy does once a client shows up
#[derive(Debug, Clone, Copy)]
pub enum SocksBehavior {
    /// Answer the CONNECT request and relay to this address, whatever was requested
    Relay(SocketAddr),
    /// Answer the CONNECT request with this reply code (2 = not allowed, 5 = refused)
    Reject(u8),
    /// Read the greeting and never answer
    Stall,
}

/// Events reported by the fake servers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// CONNECT request for `host:port`
    Connect(String),
    /// The client closed its socket
    Closed,
}

pub async fn spawn_socks(behavior: SocksBehavior) -> (SocketAddr, mpsc::UnboundedReceiver<Event>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let events = events.clone();
            tokio::spawn(async move {
                let _ = handle_socks(socket, behavior, &events).await;
                let _ = events.send(Event::Closed);
            });
        }
    });
    (addr, rx)
}

async fn handle_socks(
    mut client: TcpStream,
    behavior: SocksBehavior,
    events: &mpsc::UnboundedSender<Event>,
) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;

    if let SocksBehavior::Stall = behavior {
        wait_for_close(&mut client).await;
        return Ok(());
    }
    client.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        _ => {
            let len = client.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
    };
    let port = client.read_u16().await?;
    let _ = events.send(Event::Connect(format!("{}:{}", host, port)));

    match behavior {
        SocksBehavior::Reject(code) => {
            client
                .write_all(&[0x05, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            Ok(())
        }
        SocksBehavior::Relay(upstream) => {
            let mut upstream = TcpStream::connect(upstream).await?;
            client
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
                .await?;
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
            Ok(())
        }
        SocksBehavior::Stall => Ok(()),
    }
}

async fn wait_for_close(stream: &mut TcpStream) {
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Accepts connections, never writes, reports every closed client
pub async fn spawn_silent() -> (SocketAddr, mpsc::UnboundedReceiver<Event>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let events = events.clone();
            tokio::spawn(async move {
                wait_for_close(&mut socket).await;
                let _ = events.send(Event::Closed);
            });
        }
    });
    (addr, rx)
}

/// Echoes every byte back
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.into_split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// Counters kept by [`spawn_plaintext_postgres`]
#[derive(Debug, Default)]
pub struct PostgresStats {
    pub ssl_requests: AtomicUsize,
    pub logins: AtomicUsize,
}

const SSL_REQUEST_CODE: i32 = 80877103;

fn backend(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Postgres stub that answers `N` to SSLRequest and trusts every plaintext login
pub async fn spawn_plaintext_postgres() -> (SocketAddr, Arc<PostgresStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(PostgresStats::default());

    let shared = stats.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let stats = shared.clone();
            tokio::spawn(async move {
                let _ = serve_postgres(socket, &stats).await;
            });
        }
    });
    (addr, stats)
}

async fn serve_postgres(mut socket: TcpStream, stats: &PostgresStats) -> std::io::Result<()> {
    loop {
        let len = socket.read_i32().await? as usize;
        let mut body = vec![0u8; len.saturating_sub(4)];
        socket.read_exact(&mut body).await?;

        if body.len() == 4 && i32::from_be_bytes([body[0], body[1], body[2], body[3]]) == SSL_REQUEST_CODE {
            stats.ssl_requests.fetch_add(1, Ordering::SeqCst);
            socket.write_all(b"N").await?;
            continue;
        }

        stats.logins.fetch_add(1, Ordering::SeqCst);
        let mut reply = backend(b'R', &0i32.to_be_bytes());
        reply.extend(backend(b'S', b"server_version\x0016.2\x00"));
        let mut key = 4242i32.to_be_bytes().to_vec();
        key.extend_from_slice(&99i32.to_be_bytes());
        reply.extend(backend(b'K', &key));
        reply.extend(backend(b'Z', b"I"));
        socket.write_all(&reply).await?;
        wait_for_close(&mut socket).await;
        return Ok(());
    }
}

/// Poll `check` until it holds or `limit` passes
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Wait for the next [`Event::Closed`], skipping other events
pub async fn closed(events: &mut mpsc::UnboundedReceiver<Event>, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        while let Some(event) = events.recv().await {
            if event == Event::Closed {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}

struct FakeSshHandler {
    authorized: russh::keys::PublicKey,
    relay: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
}

impl russh::server::Handler for FakeSshHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<russh::server::Auth, Self::Error> {
        if user == SSH_STALLED_USER {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if user == SSH_USER && public_key.key_data() == self.authorized.key_data() {
            Ok(russh::server::Auth::Accept)
        } else {
            Ok(russh::server::Auth::reject())
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: russh::Channel<russh::server::Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut russh::server::Session,
    ) -> Result<bool, Self::Error> {
        let _ = self
            .events
            .send(Event::Connect(format!("{}:{}", host_to_connect, port_to_connect)));
        if host_to_connect != SSH_FORWARDABLE_HOST {
            return Ok(false);
        }

        let relay = self.relay;
        tokio::spawn(async move {
            if let Ok(mut upstream) = TcpStream::connect(relay).await {
                let mut channel = channel.into_stream();
                let _ = tokio::io::copy_bidirectional(&mut channel, &mut upstream).await;
            }
        });
        Ok(true)
    }
}

/// SSH server accepting [`SSH_USER`] with [`SSH_TEST_KEY`].
///
/// `direct-tcpip` requests for [`SSH_FORWARDABLE_HOST`] are relayed to `relay`, whatever
/// port they name; any other destination is refused.
pub async fn spawn_ssh(relay: SocketAddr) -> (SocketAddr, mpsc::UnboundedReceiver<Event>) {
    let host_key = russh::keys::decode_secret_key(SSH_TEST_KEY, None).unwrap();
    let authorized = host_key.public_key().clone();
    let config = Arc::new(russh::server::Config {
        keys: vec![host_key],
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let handler = FakeSshHandler {
                authorized: authorized.clone(),
                relay,
                events: events.clone(),
            };
            let config = config.clone();
            let events = events.clone();
            tokio::spawn(async move {
                if let Ok(session) = russh::server::run_stream(config, socket, handler).await {
                    let _ = session.await;
                }
                let _ = events.send(Event::Closed);
            });
        }
    });
    (addr, rx)
}

/// Sends an SSH identification line, then never writes again
pub async fn spawn_ssh_banner_only() -> (SocketAddr, mpsc::UnboundedReceiver<Event>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let events = events.clone();
            tokio::spawn(async move {
                if socket.write_all(b"SSH-2.0-OpenSSH_9.0\r\n").await.is_ok() {
                    wait_for_close(&mut socket).await;
                }
                let _ = events.send(Event::Closed);
            });
        }
    });
    (addr, rx)
}
