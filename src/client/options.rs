//! Connection options and their resolution

use super::connection_string::{format_host_port, ConnectionUri, SANITIZED_PASSWORD};
use super::dialect::Dialect;
use crate::connection::SslMode;
use crate::tunnel::{Endpoint, ProxyConfig, SshConfig, TunnelPlan};
use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

/// Structured target coordinates
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetFields {
    /// SQL dialect
    pub dialect: Option<Dialect>,
    /// Database host
    pub host: Option<String>,
    /// Database port (dialect default when omitted)
    pub port: Option<u16>,
    /// Database name
    pub database: Option<String>,
    /// User name
    pub user: Option<String>,
    /// Password
    pub password: Option<String>,
}

impl std::fmt::Debug for TargetFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetFields")
            .field("dialect", &self.dialect)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| SANITIZED_PASSWORD))
            .finish()
    }
}

/// Where to connect
#[derive(Clone)]
pub enum Target {
    /// `<dialect>://[user[:pass]@]host[:port]/[database]`
    Uri(String),
    /// Structured fields
    Fields(TargetFields),
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uri(uri) => f
                .debug_tuple("Uri")
                .field(&super::connection_string::sanitize_uri(uri))
                .finish(),
            Self::Fields(fields) => f.debug_tuple("Fields").field(fields).finish(),
        }
    }
}

/// Everything needed for one logical connection request
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    target: Target,
    ssl_mode: Option<SslMode>,
    proxy: Option<ProxyConfig>,
    ssh: Option<SshConfig>,
    connect_timeout: Option<Duration>,
    dialect_options: Option<serde_json::Value>,
}

impl ConnectionOptions {
    fn with_target(target: Target) -> Self {
        Self {
            target,
            ssl_mode: None,
            proxy: None,
            ssh: None,
            connect_timeout: None,
            dialect_options: None,
        }
    }

    /// Options targeting a connection URI
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self::with_target(Target::Uri(uri.into()))
    }

    /// Options targeting structured fields
    pub fn from_fields(fields: TargetFields) -> Self {
        Self::with_target(Target::Fields(fields))
    }

    /// Builder for structured targets
    pub fn builder() -> ConnectionOptionsBuilder {
        ConnectionOptionsBuilder::default()
    }

    /// SSL policy; overrides a `sslmode` URI parameter
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = Some(mode);
        self
    }

    /// Route through a SOCKS5 proxy
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Route through an SSH jump host
    pub fn ssh(mut self, ssh: SshConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }

    /// Bound every physical attempt (tunnel and authentication)
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// TLS options passed to the driver untouched under [`SslMode::Manual`]
    pub fn dialect_options(mut self, options: serde_json::Value) -> Self {
        self.dialect_options = Some(options);
        self
    }

    /// Target as given
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Rewrite host and port only.
    ///
    /// Credentials, dialect, database and every other option are kept.
    pub fn change_host_and_port(&self, host: &str, port: u16) -> Result<Self> {
        let target = match &self.target {
            Target::Uri(uri) => Target::Uri(
                ConnectionUri::parse(uri)?
                    .change_host_and_port(host, port)
                    .as_str()
                    .to_string(),
            ),
            Target::Fields(fields) => Target::Fields(TargetFields {
                host: Some(host.to_string()),
                port: Some(port),
                ..fields.clone()
            }),
        };
        Ok(Self {
            target,
            ..self.clone()
        })
    }

    /// Validate and apply defaults. No socket is opened.
    pub fn resolve(&self) -> Result<ResolvedOptions> {
        let (fields, uri) = match &self.target {
            Target::Uri(raw) => {
                let uri = ConnectionUri::parse(raw)?;
                let fields = TargetFields {
                    dialect: Some(uri.dialect()),
                    host: Some(uri.host().to_string()),
                    port: uri.port(),
                    database: uri.database().map(str::to_string),
                    user: uri.user().map(str::to_string),
                    password: uri.password().map(str::to_string),
                };
                (fields, Some(uri))
            }
            Target::Fields(fields) => (fields.clone(), None),
        };

        let dialect = fields
            .dialect
            .ok_or_else(|| Error::Configuration("dialect is required".into()))?;
        let host = fields
            .host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| Error::Configuration("host is required".into()))?;
        let port = dialect.resolve_port(fields.port)?;

        let ssl_mode = match self.ssl_mode {
            Some(mode) => mode,
            None => match &uri {
                Some(uri) => uri.ssl_mode()?.unwrap_or_default(),
                None => SslMode::default(),
            },
        };

        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        if let Some(ssh) = &self.ssh {
            ssh.validate()?;
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(Error::Configuration(
                "connect timeout must be greater than zero".into(),
            ));
        }

        Ok(ResolvedOptions {
            dialect,
            host: host.clone(),
            port,
            server_name: host,
            database: fields.database,
            user: fields.user,
            password: fields.password,
            ssl_mode,
            proxy: self.proxy.clone(),
            ssh: self.ssh.clone(),
            connect_timeout: self.connect_timeout,
            dialect_options: self.dialect_options.clone(),
            uri,
        })
    }
}

/// Builder for structured [`ConnectionOptions`]
#[derive(Debug, Default)]
pub struct ConnectionOptionsBuilder {
    fields: TargetFields,
    ssl_mode: Option<SslMode>,
    proxy: Option<ProxyConfig>,
    ssh: Option<SshConfig>,
    connect_timeout: Option<Duration>,
    dialect_options: Option<serde_json::Value>,
}

impl ConnectionOptionsBuilder {
    /// SQL dialect
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.fields.dialect = Some(dialect);
        self
    }

    /// Database host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.fields.host = Some(host.into());
        self
    }

    /// Database port
    pub fn port(mut self, port: u16) -> Self {
        self.fields.port = Some(port);
        self
    }

    /// Database name
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.fields.database = Some(database.into());
        self
    }

    /// User name
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.fields.user = Some(user.into());
        self
    }

    /// Password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.fields.password = Some(password.into());
        self
    }

    /// SSL policy
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = Some(mode);
        self
    }

    /// SOCKS5 proxy
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// SSH jump host
    pub fn ssh(mut self, ssh: SshConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }

    /// Per-attempt timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Manual TLS options
    pub fn dialect_options(mut self, options: serde_json::Value) -> Self {
        self.dialect_options = Some(options);
        self
    }

    /// Finish; validation happens in [`ConnectionOptions::resolve`]
    pub fn build(self) -> ConnectionOptions {
        ConnectionOptions {
            target: Target::Fields(self.fields),
            ssl_mode: self.ssl_mode,
            proxy: self.proxy,
            ssh: self.ssh,
            connect_timeout: self.connect_timeout,
            dialect_options: self.dialect_options,
        }
    }
}

/// Options with defaults applied and validated
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    /// SQL dialect
    pub dialect: Dialect,
    /// Host the driver dials
    pub host: String,
    /// Port the driver dials
    pub port: u16,
    /// Real database host, kept across [`ResolvedOptions::change_host_and_port`]
    pub server_name: String,
    /// Database name
    pub database: Option<String>,
    /// User name
    pub user: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Requested SSL policy
    pub ssl_mode: SslMode,
    /// SOCKS5 proxy
    pub proxy: Option<ProxyConfig>,
    /// SSH jump host
    pub ssh: Option<SshConfig>,
    /// Per-attempt timeout
    pub connect_timeout: Option<Duration>,
    /// Manual TLS options
    pub dialect_options: Option<serde_json::Value>,
    uri: Option<ConnectionUri>,
}

impl ResolvedOptions {
    /// Target as `<dialect>://user:**sanitizedPassword**@host:port/db`
    pub fn sanitized_uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return uri.sanitize();
        }
        let userinfo = match (&self.user, &self.password) {
            (Some(user), Some(_)) => format!("{}:{}@", user, SANITIZED_PASSWORD),
            (Some(user), None) => format!("{}@", user),
            (None, _) => String::new(),
        };
        format!(
            "{}://{}{}/{}",
            self.dialect,
            userinfo,
            format_host_port(&self.host, Some(self.port)),
            self.database.as_deref().unwrap_or("")
        )
    }

    /// Whether a proxy or SSH hop is configured
    pub fn needs_tunnel(&self) -> bool {
        self.proxy.is_some() || self.ssh.is_some()
    }

    /// Hop plan towards the real target, `None` without hops
    pub fn tunnel_plan(&self) -> Option<TunnelPlan> {
        if !self.needs_tunnel() {
            return None;
        }
        Some(TunnelPlan::from_parts(
            Endpoint::new(self.host.clone(), self.port),
            self.proxy.clone(),
            self.ssh.clone(),
        ))
    }

    /// Point the driver at `host:port`, keeping everything else
    pub fn change_host_and_port(&self, host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            uri: self
                .uri
                .as_ref()
                .map(|uri| uri.change_host_and_port(host, port)),
            ..self.clone()
        }
    }
}
