//! SOCKS5 hop

use super::service::{Endpoint, HopState, SocketCounter, TunnelService, TunnelStream};
use crate::client::SANITIZED_PASSWORD;
use crate::error::{classify_socks, proxy_connect};
use crate::metrics::{counters, labels};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::Instrument;

/// Upper bound on the SOCKS5 negotiation once the proxy socket is open
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4);

/// SOCKS5 proxy settings
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// User name for username/password authentication
    #[serde(default)]
    pub user_id: Option<String>,
    /// Password for username/password authentication
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Unauthenticated proxy
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user_id: None,
            password: None,
        }
    }

    /// Authenticate with username/password
    pub fn credentials(mut self, user_id: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.password = Some(password.into());
        self
    }

    /// Proxy endpoint
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// `socks5://[user[:**sanitizedPassword**]@]host:port`
    pub fn sanitized_address(&self) -> String {
        let userinfo = match (&self.user_id, &self.password) {
            (Some(user), Some(_)) => format!("{}:{}@", user, SANITIZED_PASSWORD),
            (Some(user), None) => format!("{}@", user),
            _ => String::new(),
        };
        format!("socks5://{}{}", userinfo, self.endpoint())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Configuration("proxy host is required".into()));
        }
        if self.port == 0 {
            return Err(Error::Configuration("proxy port is required".into()));
        }
        if self.password.is_some() && self.user_id.is_none() {
            return Err(Error::Configuration(
                "proxy password given without a user id".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.sanitized_address())
    }
}

/// SOCKS5 CONNECT hop
#[derive(Debug)]
pub struct SocksHop {
    config: ProxyConfig,
    state: HopState,
}

impl SocksHop {
    /// Hop through `config`, reporting sockets to `sockets`
    pub fn new(config: ProxyConfig, sockets: SocketCounter) -> Self {
        Self {
            config,
            state: HopState::new(sockets),
        }
    }

    async fn open(&self, inbound: Option<TunnelStream>, next: &Endpoint) -> Result<TunnelStream> {
        let address = self.address();

        let socket: TunnelStream = match inbound {
            Some(stream) => stream,
            None => {
                let tcp = TcpStream::connect((self.config.host.as_str(), self.config.port))
                    .await
                    .map_err(|e| proxy_connect(&address, e.to_string()))?;
                tcp.set_nodelay(true).ok();
                Box::new(self.state.track(tcp))
            }
        };

        let target = (next.host.as_str(), next.port);
        let handshake = async {
            match (&self.config.user_id, &self.config.password) {
                (Some(user), password) => {
                    Socks5Stream::connect_with_password_and_socket(
                        socket,
                        target,
                        user,
                        password.as_deref().unwrap_or(""),
                    )
                    .await
                }
                (None, _) => Socks5Stream::connect_with_socket(socket, target).await,
            }
        };

        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| proxy_connect(&address, "SOCKS5 handshake timed out"))?
            .map_err(|e| classify_socks(e, &address, &next.to_string()))?;

        Ok(stream.into_inner())
    }
}

#[async_trait]
impl TunnelService for SocksHop {
    async fn connect(&self, inbound: Option<TunnelStream>, next: &Endpoint) -> Result<TunnelStream> {
        let address = self.address();
        let span = tracing::debug_span!("socks_hop", proxy = %address, next = %next);

        let result = self
            .state
            .run(self.open(inbound, next), || {
                proxy_connect(&address, "tunnel stopped")
            })
            .instrument(span)
            .await;

        match &result {
            Ok(_) => {
                tracing::debug!(proxy = %address, next = %next, "SOCKS5 hop established");
                counters::hop_connect(labels::HOP_SOCKS, labels::OUTCOME_OK);
            }
            Err(e) => {
                tracing::debug!(proxy = %address, "SOCKS5 hop failed: {}", e);
                counters::hop_connect(labels::HOP_SOCKS, labels::OUTCOME_ERROR);
            }
        }
        result
    }

    fn stop(&self) {
        self.state.stop();
    }

    fn last_error(&self) -> Option<Error> {
        self.state.last_error()
    }

    fn endpoint(&self) -> Endpoint {
        self.config.endpoint()
    }

    fn address(&self) -> String {
        self.config.sanitized_address()
    }
}
