//! Bundled Postgres driver
//!
//! Speaks just enough of the frontend/backend protocol to prove a login works:
//! SSLRequest negotiation, startup, cleartext or SCRAM-SHA-256 authentication, and
//! the wait for `ReadyForQuery`. Closing sends `Terminate`.

use super::state::ConnectionState;
use super::tls::{SslMode, TlsConfig};
use super::transport::Transport;
use crate::auth::{ScramClient, SCRAM_MECHANISM};
use crate::client::{Dialect, Driver, DriverConfig, TlsOptions};
use crate::protocol::backend::{TLS_ACCEPTED, TLS_REFUSED};
use crate::protocol::{frontend, next_reply, AuthRequest, Reply, ServerNotice};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::io;
use tracing::Instrument;

/// Postgres probe driver
#[derive(Debug, Clone, Default)]
pub struct PostgresDriver {
    ca_cert_path: Option<String>,
    application_name: Option<String>,
}

impl PostgresDriver {
    /// Driver using the system trust store
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust the CA certificates in this PEM file instead of the system roots
    pub fn ca_cert_path(mut self, path: impl Into<String>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// `application_name` startup parameter
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Translate dialect TLS options into a rustls configuration, `None` for plaintext
    fn tls_config(&self, options: &TlsOptions) -> Result<Option<TlsConfig>> {
        let (accept_invalid, ca_path) = match options {
            TlsOptions::Disabled => return Ok(None),
            TlsOptions::Ssl {
                reject_unauthorized,
            } => (!reject_unauthorized, self.ca_cert_path.clone()),
            TlsOptions::Encrypt {
                encrypt: false, ..
            } => return Ok(None),
            TlsOptions::Encrypt {
                trust_server_certificate,
                ..
            } => (*trust_server_certificate, self.ca_cert_path.clone()),
            TlsOptions::Manual(value) => {
                if !options.uses_tls() {
                    return Ok(None);
                }
                let reject = value
                    .get("rejectUnauthorized")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                let ca = value
                    .get("caCertPath")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| self.ca_cert_path.clone());
                (!reject, ca)
            }
        };

        let mut builder = TlsConfig::builder().danger_accept_invalid_certs(accept_invalid);
        if let Some(path) = ca_path {
            builder = builder.ca_cert_path(path);
        }
        builder.build().map(Some)
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    type Connection = PgConnection;

    async fn connect(&self, config: &DriverConfig) -> Result<PgConnection> {
        if config.dialect != Dialect::Postgres {
            return Err(Error::Configuration(format!(
                "PostgresDriver cannot connect to dialect {}",
                config.dialect
            )));
        }
        let tls = self.tls_config(&config.tls)?;

        let transport = match config.connect_timeout {
            Some(limit) => tokio::time::timeout(
                limit,
                Transport::connect_tcp(&config.host, config.port),
            )
            .await
            .map_err(|_| Error::from(io::Error::from(io::ErrorKind::TimedOut)))??,
            None => Transport::connect_tcp(&config.host, config.port).await?,
        };

        let mut conn = PgConnection::new(transport);
        if let Some(tls) = tls {
            conn.negotiate_tls(&tls, &config.server_name).await?;
        }

        let user = config.user.clone().unwrap_or_else(whoami::username);
        let database = config.database.clone().unwrap_or_else(|| user.clone());
        let startup = Startup {
            user,
            database,
            password: config.password.clone(),
            application_name: self.application_name.clone(),
        };
        conn.startup(&startup).await?;
        conn.ssl_mode = config.ssl_mode;
        Ok(conn)
    }

    async fn close(&self, connection: PgConnection) -> Result<()> {
        connection.close().await
    }
}

struct Startup {
    user: String,
    database: String,
    password: Option<String>,
    application_name: Option<String>,
}

/// An authenticated Postgres session
pub struct PgConnection {
    transport: Transport,
    state: ConnectionState,
    read_buf: BytesMut,
    ssl_mode: SslMode,
    process_id: Option<i32>,
    secret_key: Option<i32>,
    parameters: HashMap<String, String>,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("ssl_mode", &self.ssl_mode)
            .field("process_id", &self.process_id)
            .finish()
    }
}

impl PgConnection {
    fn new(transport: Transport) -> Self {
        Self {
            transport,
            state: ConnectionState::Initial,
            read_buf: BytesMut::with_capacity(8192),
            ssl_mode: SslMode::Disabled,
            process_id: None,
            secret_key: None,
            parameters: HashMap::new(),
        }
    }

    /// Current protocol state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the session runs over TLS
    pub fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// Concrete SSL mode the session was opened with
    pub fn ssl_mode(&self) -> SslMode {
        self.ssl_mode
    }

    /// Backend process id from `BackendKeyData`
    pub fn process_id(&self) -> Option<i32> {
        self.process_id
    }

    /// Cancellation secret from `BackendKeyData`
    pub fn secret_key(&self) -> Option<i32> {
        self.secret_key
    }

    /// Server parameter reported during startup (`server_version`, ...)
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Send SSLRequest and upgrade on `S`.
    ///
    /// `server_name` is the real database host, which differs from the dialled host when
    /// the connection goes through a tunnel.
    async fn negotiate_tls(&mut self, tls: &TlsConfig, server_name: &str) -> Result<()> {
        self.state.transition(ConnectionState::NegotiatingTls)?;
        self.send(frontend::ssl_request).await?;

        while self.read_buf.is_empty() {
            if self.transport.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
        let response = self.read_buf[0];
        self.read_buf.advance(1);

        match response {
            TLS_ACCEPTED => {
                // Bytes sent before the handshake would be read as if they were encrypted.
                if !self.read_buf.is_empty() {
                    return Err(Error::Protocol(
                        "unencrypted data received after SSL response".into(),
                    ));
                }
                tracing::debug!("server accepted TLS, upgrading connection");
                let plain = std::mem::replace(&mut self.transport, Transport::Detached);
                self.transport = plain.upgrade_to_tls(tls, server_name).await?;
                Ok(())
            }
            TLS_REFUSED => {
                tracing::debug!("server rejected TLS");
                Err(Error::Tls("server does not support TLS".into()))
            }
            other => Err(Error::Protocol(format!(
                "unexpected SSLRequest response byte: 0x{:02X}",
                other
            ))),
        }
    }

    async fn startup(&mut self, startup: &Startup) -> Result<()> {
        async {
            self.state.transition(ConnectionState::AwaitingAuth)?;

            let mut params = vec![
                ("user", startup.user.as_str()),
                ("database", startup.database.as_str()),
            ];
            if let Some(name) = &startup.application_name {
                params.push(("application_name", name.as_str()));
            }
            self.send(|out| frontend::startup(out, params)).await?;

            self.state.transition(ConnectionState::Authenticating)?;
            self.authenticate(startup).await?;

            self.state.transition(ConnectionState::Ready)?;
            tracing::debug!(tls = self.is_tls(), "startup complete");
            Ok(())
        }
        .instrument(tracing::debug_span!(
            "startup",
            user = %startup.user,
            database = %startup.database
        ))
        .await
    }

    async fn authenticate(&mut self, startup: &Startup) -> Result<()> {
        let auth_start = std::time::Instant::now();
        let mut mechanism = None;

        loop {
            match self.receive().await? {
                Reply::Auth(AuthRequest::Ok) => {
                    if let Some(mechanism) = mechanism {
                        crate::metrics::counters::auth_successful(mechanism);
                        crate::metrics::histograms::auth_duration(
                            mechanism,
                            auth_start.elapsed().as_millis() as u64,
                        );
                    }
                    // ReadyForQuery still follows
                }
                Reply::Auth(AuthRequest::Cleartext) => {
                    let label = crate::metrics::labels::MECHANISM_CLEARTEXT;
                    mechanism = Some(label);
                    crate::metrics::counters::auth_attempted(label);

                    let password = require_password(startup)?;
                    self.send(|out| frontend::password(out, password)).await?;
                }
                Reply::Auth(AuthRequest::Md5) => {
                    return Err(Error::Authentication(
                        "MD5 authentication not supported, use SCRAM-SHA-256 or cleartext".into(),
                    ));
                }
                Reply::Auth(AuthRequest::Sasl(mechanisms)) => {
                    let label = crate::metrics::labels::MECHANISM_SCRAM;
                    mechanism = Some(label);
                    crate::metrics::counters::auth_attempted(label);
                    self.handle_sasl(&mechanisms, startup).await?;
                }
                Reply::Auth(AuthRequest::SaslContinue(_) | AuthRequest::SaslFinal(_)) => {
                    return Err(Error::Protocol(
                        "SASL message outside of a SASL exchange".into(),
                    ));
                }
                Reply::KeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = Some(process_id);
                    self.secret_key = Some(secret_key);
                }
                Reply::Parameter { name, value } => {
                    tracing::trace!("parameter status: {} = {}", name, value);
                    self.parameters.insert(name, value);
                }
                Reply::Notice(notice) => {
                    tracing::debug!("notice during startup: {}", notice);
                }
                Reply::Ready(_) => return Ok(()),
                Reply::Error(notice) => return Err(server_error(notice)),
            }
        }
    }

    async fn handle_sasl(&mut self, mechanisms: &[String], startup: &Startup) -> Result<()> {
        if !mechanisms.iter().any(|m| m == SCRAM_MECHANISM) {
            return Err(Error::Authentication(format!(
                "server does not offer {}, available: {}",
                SCRAM_MECHANISM,
                mechanisms.join(", ")
            )));
        }

        let scram = ScramClient::new(startup.user.clone(), require_password(startup)?);
        let client_first = scram.client_first();
        self.send(|out| frontend::sasl_initial(out, SCRAM_MECHANISM, client_first.as_bytes()))
            .await?;

        let server_first = match self.receive().await? {
            Reply::Auth(AuthRequest::SaslContinue(data)) => data,
            Reply::Error(notice) => return Err(server_error(notice)),
            other => {
                return Err(Error::Protocol(format!(
                    "expected SASL continue, got {:?}",
                    other
                )))
            }
        };
        let server_first = utf8(server_first, "server-first-message")?;
        let (client_final, state) = scram.client_final(&server_first)?;

        self.send(|out| frontend::sasl_response(out, client_final.as_bytes()))
            .await?;

        let server_final = match self.receive().await? {
            Reply::Auth(AuthRequest::SaslFinal(data)) => data,
            Reply::Error(notice) => return Err(server_error(notice)),
            other => {
                return Err(Error::Protocol(format!(
                    "expected SASL final, got {:?}",
                    other
                )))
            }
        };
        let server_final = utf8(server_final, "server-final-message")?;
        scram.verify_server_final(&server_final, &state)?;

        tracing::debug!("SCRAM-SHA-256 exchange verified");
        Ok(())
    }

    async fn send(&mut self, write: impl FnOnce(&mut BytesMut)) -> Result<()> {
        let mut out = BytesMut::new();
        write(&mut out);
        self.transport.write_all(&out).await?;
        self.transport.flush().await
    }

    async fn receive(&mut self) -> Result<Reply> {
        loop {
            if let Some(reply) =
                next_reply(&mut self.read_buf).map_err(|e| Error::Protocol(e.to_string()))?
            {
                return Ok(reply);
            }
            if self.transport.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Send `Terminate` and shut the socket down
    pub async fn close(mut self) -> Result<()> {
        self.state.transition(ConnectionState::Closed)?;
        let _ = self.send(frontend::terminate).await;
        self.transport.shutdown().await
    }
}

fn require_password(startup: &Startup) -> Result<&str> {
    startup
        .password
        .as_deref()
        .ok_or_else(|| Error::Authentication("password required".into()))
}

fn utf8(data: bytes::Bytes, what: &str) -> Result<String> {
    String::from_utf8(data.to_vec())
        .map_err(|_| Error::Authentication(format!("invalid UTF-8 in SCRAM {}", what)))
}

fn server_error(notice: ServerNotice) -> Error {
    if notice.is_auth_failure() {
        return Error::Authentication(notice.to_string());
    }
    Error::DatabaseConnect {
        message: notice.to_string(),
        uri: String::new(),
    }
}
