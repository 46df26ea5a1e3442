//! Driver collaborator
//!
//! The negotiator never speaks a database protocol itself. It hands a fully resolved
//! [`DriverConfig`] to a [`Driver`], which dials `host:port` (possibly the loopback
//! tunnel entry) and authenticates. A driver never learns whether a tunnel exists.

use super::dialect::{Dialect, TlsOptions};
use crate::connection::SslMode;
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Resolved coordinates handed to a [`Driver`]
#[derive(Clone)]
pub struct DriverConfig {
    /// Target dialect
    pub dialect: Dialect,
    /// Host to dial (the tunnel entry when hops are configured)
    pub host: String,
    /// Port to dial
    pub port: u16,
    /// Real database host, used for TLS server name checks
    pub server_name: String,
    /// Database name
    pub database: Option<String>,
    /// User name
    pub user: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Concrete SSL mode these options were built for
    pub ssl_mode: SslMode,
    /// Dialect-specific TLS options
    pub tls: TlsOptions,
    /// Per-attempt timeout, if any
    pub connect_timeout: Option<Duration>,
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConfig")
            .field("dialect", &self.dialect)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("server_name", &self.server_name)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("ssl_mode", &self.ssl_mode)
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// A database driver able to open and close one authenticated connection
#[async_trait]
pub trait Driver: Send + Sync {
    /// Live connection type
    type Connection: Send;

    /// Open and authenticate a connection
    async fn connect(&self, config: &DriverConfig) -> Result<Self::Connection>;

    /// Close a connection previously returned by [`Driver::connect`]
    async fn close(&self, connection: Self::Connection) -> Result<()>;
}

#[async_trait]
impl<D: Driver + ?Sized> Driver for std::sync::Arc<D> {
    type Connection = D::Connection;

    async fn connect(&self, config: &DriverConfig) -> Result<Self::Connection> {
        (**self).connect(config).await
    }

    async fn close(&self, connection: Self::Connection) -> Result<()> {
        (**self).close(connection).await
    }
}
