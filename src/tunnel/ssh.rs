//! SSH jump-host hop
//!
//! Connects to the SSH server (directly or over the previous hop's stream),
//! authenticates with a private key, then opens a `direct-tcpip` channel to the next
//! endpoint. The channel, wrapped as a stream, is what the next hop or the driver sees.

use super::service::{
    Cancellable, Endpoint, HopState, SocketCounter, TunnelService, TunnelStream,
};
use crate::error::{ssh_connect, ssh_forward};
use crate::metrics::{counters, labels};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::ChannelStream;
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::Instrument;

const DEFAULT_SSH_PORT: u16 = 22;

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// SSH jump host settings
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    /// SSH server host
    pub host: String,
    /// SSH server port (22 when omitted)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user
    pub username: String,
    /// OpenSSH private key, PEM text
    pub private_key: String,
    /// Passphrase for an encrypted private key
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl SshConfig {
    /// Key-authenticated jump host on port 22
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            private_key: private_key.into(),
            passphrase: None,
        }
    }

    /// Use a non-default port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Passphrase protecting the private key
    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// SSH server endpoint
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// `user@host:port`
    pub fn label(&self) -> String {
        format!("{}@{}", self.username, self.endpoint())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Configuration("ssh host is required".into()));
        }
        if self.username.is_empty() {
            return Err(Error::Configuration("ssh username is required".into()));
        }
        if self.private_key.trim().is_empty() {
            return Err(Error::Configuration("ssh private key is required".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Accepts any host key; the jump host is identified by configuration, not known_hosts
struct TunnelHandler {
    server: String,
}

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let algorithm = server_public_key.algorithm();
        tracing::debug!(
            server = %self.server,
            algorithm = algorithm.as_str(),
            "accepting ssh host key"
        );
        Ok(true)
    }
}

type Session = Arc<tokio::sync::Mutex<Handle<TunnelHandler>>>;

/// `direct-tcpip` channel that keeps its SSH session alive
pub struct SshChannel {
    inner: Pin<Box<ChannelStream<Msg>>>,
    _session: Session,
}

impl AsyncRead for SshChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for SshChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}

/// SSH jump-host hop
pub struct SshHop {
    config: SshConfig,
    state: HopState,
    sessions: Mutex<Vec<Session>>,
}

impl std::fmt::Debug for SshHop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshHop")
            .field("server", &self.config.label())
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl SshHop {
    /// Hop through `config`, reporting sockets to `sockets`
    pub fn new(config: SshConfig, sockets: SocketCounter) -> Self {
        Self {
            config,
            state: HopState::new(sockets),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Number of authenticated sessions not yet disconnected
    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    fn client_config() -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        })
    }

    async fn open(&self, inbound: Option<TunnelStream>, next: &Endpoint) -> Result<TunnelStream> {
        let server = self.config.label();

        let key = russh::keys::decode_secret_key(
            &self.config.private_key,
            self.config.passphrase.as_deref(),
        )
        .map_err(|e| ssh_connect(&server, format!("invalid private key: {}", e)))?;

        let transport: TunnelStream = match inbound {
            Some(stream) => stream,
            None => {
                let tcp = TcpStream::connect((self.config.host.as_str(), self.config.port))
                    .await
                    .map_err(|e| ssh_connect(&server, e.to_string()))?;
                tcp.set_nodelay(true).ok();
                Box::new(self.state.track(tcp))
            }
        };

        // The russh session task ignores its handle during key exchange; only an I/O
        // error ends it.
        let transport = Cancellable::new(transport, self.state.token().clone());
        let handler = TunnelHandler {
            server: server.clone(),
        };
        let mut handle = client::connect_stream(Self::client_config(), transport, handler)
            .await
            .map_err(|e| ssh_connect(&server, e.to_string()))?;

        let auth = handle
            .authenticate_publickey(
                &self.config.username,
                PrivateKeyWithHashAlg::new(Arc::new(key), None),
            )
            .await
            .map_err(|e| ssh_connect(&server, e.to_string()))?;
        if !auth.success() {
            return Err(ssh_connect(&server, "public key authentication rejected"));
        }
        tracing::debug!(server = %server, "ssh authenticated");

        let session: Session = Arc::new(tokio::sync::Mutex::new(handle));
        self.sessions.lock().push(session.clone());
        // stop() may have run while the session was being registered
        if self.state.is_stopped() {
            self.disconnect_all();
            return Err(ssh_connect(&server, "tunnel stopped"));
        }

        let channel = session
            .lock()
            .await
            .channel_open_direct_tcpip(next.host.clone(), next.port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| ssh_forward(&server, format!("{} (next hop {})", e, next)))?;

        Ok(Box::new(SshChannel {
            inner: Box::pin(channel.into_stream()),
            _session: session,
        }))
    }

    fn disconnect_all(&self) {
        let sessions: Vec<Session> = std::mem::take(&mut *self.sessions.lock());
        if sessions.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            let disconnects = sessions.into_iter().map(|session| async move {
                if let Err(e) = session
                    .lock()
                    .await
                    .disconnect(russh::Disconnect::ByApplication, "tunnel stopped", "en")
                    .await
                {
                    tracing::trace!("ssh disconnect: {}", e);
                }
            });
            futures::future::join_all(disconnects).await;
        });
    }
}

#[async_trait]
impl TunnelService for SshHop {
    async fn connect(&self, inbound: Option<TunnelStream>, next: &Endpoint) -> Result<TunnelStream> {
        let server = self.config.label();
        let span = tracing::debug_span!("ssh_hop", server = %server, next = %next);

        let result = self
            .state
            .run(self.open(inbound, next), || {
                ssh_connect(&server, "tunnel stopped")
            })
            .instrument(span)
            .await;

        match &result {
            Ok(_) => {
                tracing::debug!(server = %server, next = %next, "ssh hop established");
                counters::hop_connect(labels::HOP_SSH, labels::OUTCOME_OK);
            }
            Err(e) => {
                tracing::debug!(server = %server, "ssh hop failed: {}", e);
                counters::hop_connect(labels::HOP_SSH, labels::OUTCOME_ERROR);
            }
        }
        result
    }

    fn stop(&self) {
        self.state.stop();
        self.disconnect_all();
    }

    fn last_error(&self) -> Option<Error> {
        self.state.last_error()
    }

    fn endpoint(&self) -> Endpoint {
        self.config.endpoint()
    }

    fn address(&self) -> String {
        self.config.label()
    }
}
