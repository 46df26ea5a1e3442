//! SSL-mode negotiation and connection setup
//!
//! [`ConnectionNegotiator::connect`] resolves options, starts a loopback tunnel entry when
//! hops are configured, settles on a concrete [`SslMode`] and hands the driver a
//! [`DriverConfig`] pointing at the tunnel (or straight at the database).
//!
//! Under [`SslMode::Preferred`] every candidate in the probe order is tried with a real
//! connect-and-authenticate, one at a time. The probe connection is closed right away and
//! the winning mode is used for the connection handed back to the caller.

use super::dialect::TlsOptions;
use super::driver::{Driver, DriverConfig};
use super::options::{ConnectionOptions, ResolvedOptions};
use crate::connection::SslMode;
use crate::error::prefer_root_cause;
use crate::logging::{default_sink, SharedSink};
use crate::metrics::{counters, labels};
use crate::tunnel::LocalListener;
use crate::{Error, Result};
use tracing::{Instrument, Level};

/// Environment variable read by [`NegotiatorConfig::from_env`]
pub const SKIP_VERIFY_ENV: &str = "FRAISEQL_TLS_SKIP_VERIFY";

const LOOPBACK: &str = "127.0.0.1";

/// Negotiator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorConfig {
    /// Treat certificate errors as non-fatal.
    ///
    /// `Verify` is dropped from the probe order and an explicit `Verify` is sent to the
    /// driver with verification turned off.
    pub skip_certificate_verification: bool,
    /// Candidates tried under [`SslMode::Preferred`], in order
    pub probe_order: Vec<SslMode>,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            skip_certificate_verification: false,
            probe_order: SslMode::PROBE_ORDER.to_vec(),
        }
    }
}

impl NegotiatorConfig {
    /// Toggle the skip-verification directive
    pub fn skip_certificate_verification(mut self, skip: bool) -> Self {
        self.skip_certificate_verification = skip;
        self
    }

    /// Replace the probe order
    pub fn probe_order(mut self, order: Vec<SslMode>) -> Self {
        self.probe_order = order;
        self
    }

    /// Defaults, with the skip-verification directive taken from `FRAISEQL_TLS_SKIP_VERIFY`
    pub fn from_env() -> Self {
        let skip = std::env::var(SKIP_VERIFY_ENV)
            .map(|value| parse_flag(&value))
            .unwrap_or(false);
        Self::default().skip_certificate_verification(skip)
    }

    /// Probe candidates after applying the skip-verification directive
    pub fn candidates(&self) -> Vec<SslMode> {
        self.probe_order
            .iter()
            .copied()
            .filter(|mode| !mode.is_directive())
            .filter(|mode| !(self.skip_certificate_verification && *mode == SslMode::Verify))
            .collect()
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// An authenticated connection and the tunnel entry it runs through
pub struct Established<C> {
    connection: C,
    ssl_mode: SslMode,
    listener: Option<LocalListener>,
}

impl<C> std::fmt::Debug for Established<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("ssl_mode", &self.ssl_mode)
            .field("tunnel_port", &self.tunnel_port())
            .finish()
    }
}

impl<C> Established<C> {
    /// Driver connection
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Driver connection, mutably
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    /// Concrete mode the connection was opened with
    pub fn ssl_mode(&self) -> SslMode {
        self.ssl_mode
    }

    /// Loopback port of the tunnel entry, if hops are in use
    pub fn tunnel_port(&self) -> Option<u16> {
        self.listener.as_ref().map(LocalListener::port)
    }

    /// Tunnel entry, if hops are in use
    pub fn listener(&self) -> Option<&LocalListener> {
        self.listener.as_ref()
    }

    /// Split into connection, mode and tunnel entry.
    ///
    /// The tunnel stops when the returned listener is dropped.
    pub fn into_parts(self) -> (C, SslMode, Option<LocalListener>) {
        (self.connection, self.ssl_mode, self.listener)
    }
}

/// Resolves options, builds the tunnel and negotiates the SSL mode
pub struct ConnectionNegotiator<D> {
    driver: D,
    config: NegotiatorConfig,
    sink: SharedSink,
}

impl<D: Driver> ConnectionNegotiator<D> {
    /// Negotiator with default settings logging through `tracing`
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, NegotiatorConfig::default())
    }

    /// Negotiator with explicit settings
    pub fn with_config(driver: D, config: NegotiatorConfig) -> Self {
        Self {
            driver,
            config,
            sink: default_sink(),
        }
    }

    /// Send warnings and probe reports to `sink`
    pub fn with_logger(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Current settings
    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Wrapped driver
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Open an authenticated connection.
    ///
    /// Configuration errors are returned before any socket is opened. On failure every
    /// socket opened for the request, tunnel included, is closed before returning.
    pub async fn connect(&self, options: ConnectionOptions) -> Result<Established<D::Connection>> {
        let resolved = options.resolve()?;
        let uri = resolved.sanitized_uri();
        let span = tracing::info_span!(
            "negotiate",
            dialect = %resolved.dialect,
            uri = %uri,
            ssl_mode = %resolved.ssl_mode
        );

        self.connect_resolved(&resolved, &uri).instrument(span).await
    }

    async fn connect_resolved(
        &self,
        resolved: &ResolvedOptions,
        uri: &str,
    ) -> Result<Established<D::Connection>> {
        let listener = match resolved.tunnel_plan() {
            Some(plan) => Some(LocalListener::start(plan).await?),
            None => None,
        };
        let target = match &listener {
            Some(listener) => resolved.change_host_and_port(LOOPBACK, listener.port()),
            None => resolved.clone(),
        };

        match self.negotiate(&target, listener.as_ref(), uri).await {
            Ok((connection, ssl_mode)) => {
                tracing::info!(ssl_mode = %ssl_mode, tunnelled = listener.is_some(), "connected");
                Ok(Established {
                    connection,
                    ssl_mode,
                    listener,
                })
            }
            Err(e) => {
                if let Some(listener) = &listener {
                    listener.stop();
                }
                tracing::debug!("connection failed: {}", e);
                Err(e)
            }
        }
    }

    /// Close the connection, then the tunnel entry
    pub async fn close(&self, established: Established<D::Connection>) -> Result<()> {
        let (connection, _, listener) = established.into_parts();
        let result = self.driver.close(connection).await;
        if let Some(listener) = listener {
            listener.stop();
        }
        result
    }

    async fn negotiate(
        &self,
        target: &ResolvedOptions,
        listener: Option<&LocalListener>,
        uri: &str,
    ) -> Result<(D::Connection, SslMode)> {
        let mode = if target.ssl_mode != SslMode::Preferred {
            target.ssl_mode
        } else if !target.dialect.profile().supports_tls() {
            self.sink.log(
                Level::WARN,
                &format!(
                    "ignoring sslMode={}, not supported for dialect {}",
                    SslMode::Preferred,
                    target.dialect
                ),
            );
            self.fallback_mode(target)
        } else {
            self.probe(target, listener, uri).await?
        };

        let tls = self.tls_options(target, mode);
        let connection = self.attempt(target, mode, tls, listener, uri).await?;
        Ok((connection, mode))
    }

    /// Try each candidate; the first one that authenticates wins
    async fn probe(
        &self,
        target: &ResolvedOptions,
        listener: Option<&LocalListener>,
        uri: &str,
    ) -> Result<SslMode> {
        let candidates = self.config.candidates();
        let mut last_error = None;

        for mode in candidates {
            let tls = self.tls_options(target, mode);
            tracing::debug!(ssl_mode = %mode, "probing ssl mode");

            match self.attempt(target, mode, tls, listener, uri).await {
                Ok(connection) => {
                    if let Err(e) = self.driver.close(connection).await {
                        tracing::debug!("closing probe connection: {}", e);
                    }
                    counters::ssl_probe(mode.as_str(), labels::OUTCOME_OK);
                    self.sink
                        .log(Level::DEBUG, &format!("sslMode={} accepted by server", mode));
                    return Ok(mode);
                }
                Err(e) => {
                    counters::ssl_probe(mode.as_str(), labels::OUTCOME_ERROR);
                    self.sink
                        .log(Level::DEBUG, &format!("sslMode={} probe failed: {}", mode, e));
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Configuration("no ssl modes left to probe".into())
        }))
    }

    /// Dialect TLS options for a concrete mode
    fn tls_options(&self, target: &ResolvedOptions, mode: SslMode) -> TlsOptions {
        if mode == SslMode::Manual {
            return TlsOptions::Manual(
                target
                    .dialect_options
                    .clone()
                    .unwrap_or(serde_json::Value::Null),
            );
        }

        let effective = if self.config.skip_certificate_verification && mode == SslMode::Verify {
            SslMode::Required
        } else {
            mode
        };

        match target.dialect.profile().tls_options(effective) {
            Some(tls) => tls,
            None => {
                if mode.uses_tls() {
                    self.sink.log(
                        Level::WARN,
                        &format!(
                            "ignoring sslMode={}, not supported for dialect {}",
                            mode, target.dialect
                        ),
                    );
                }
                match &target.dialect_options {
                    Some(options) => TlsOptions::Manual(options.clone()),
                    None => TlsOptions::Disabled,
                }
            }
        }
    }

    /// Mode reported when the dialect has no TLS mapping
    fn fallback_mode(&self, target: &ResolvedOptions) -> SslMode {
        if target.dialect_options.is_some() {
            SslMode::Manual
        } else {
            SslMode::Disabled
        }
    }

    /// One physical connect-and-authenticate
    async fn attempt(
        &self,
        target: &ResolvedOptions,
        mode: SslMode,
        tls: TlsOptions,
        listener: Option<&LocalListener>,
        uri: &str,
    ) -> Result<D::Connection> {
        // Errors left over from an earlier attempt do not explain this one.
        if let Some(listener) = listener {
            listener.take_error();
        }

        let config = DriverConfig {
            dialect: target.dialect,
            host: target.host.clone(),
            port: target.port,
            server_name: target.server_name.clone(),
            database: target.database.clone(),
            user: target.user.clone(),
            password: target.password.clone(),
            ssl_mode: mode,
            tls,
            connect_timeout: target.connect_timeout,
        };

        let connecting = self.driver.connect(&config);
        let result = match target.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connecting).await {
                Ok(result) => result,
                Err(_) => {
                    if let Some(listener) = listener {
                        listener.drop_sessions();
                    }
                    tracing::debug!(timeout_ms = limit.as_millis() as u64, "attempt timed out");
                    Err(Error::timed_out(uri))
                }
            },
            None => connecting.await,
        };

        result.map_err(|e| prefer_root_cause(e, listener.and_then(LocalListener::take_error), uri))
    }
}
