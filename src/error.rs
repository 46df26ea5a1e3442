//! Error types and failure classification
//!
//! Every failed connection attempt surfaces exactly one [`Error`]. Tunnel hops classify
//! their raw failures at the hop boundary; the negotiator folds driver failures into
//! [`Error::DatabaseConnect`] and prefers tunnel errors over database errors when both
//! occurred during the same attempt.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Layer a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Options were incomplete or invalid; no socket was opened
    Configuration,
    /// SOCKS5 proxy hop
    Proxy,
    /// SSH jump host hop
    Ssh,
    /// The database server or its driver
    Database,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Proxy => write!(f, "proxy"),
            Self::Ssh => write!(f, "ssh"),
            Self::Database => write!(f, "database"),
        }
    }
}

/// Crate error type
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The database (or its driver) refused or failed the connection
    #[error("{message}{}", uri_suffix(.uri))]
    DatabaseConnect {
        /// Driver or classifier message
        message: String,
        /// Sanitized target URI
        uri: String,
    },

    /// The SOCKS5 proxy itself is unreachable or misconfigured
    #[error("could not connect to proxy {proxy}: {message}{}", uri_suffix(.uri))]
    ProxyConnect {
        /// Sanitized proxy address
        proxy: String,
        /// Underlying failure
        message: String,
        /// Sanitized target URI
        uri: String,
    },

    /// The proxy is fine but could not reach the next hop or the target
    #[error("proxy {proxy} could not forward the connection: {message}{}", uri_suffix(.uri))]
    ProxyForward {
        /// Sanitized proxy address
        proxy: String,
        /// Underlying failure
        message: String,
        /// Sanitized target URI
        uri: String,
    },

    /// The SSH server could not be reached or rejected authentication
    #[error("could not connect to ssh server {server}: {message}{}", uri_suffix(.uri))]
    SshConnect {
        /// SSH server address (`user@host:port`)
        server: String,
        /// Underlying failure
        message: String,
        /// Sanitized target URI
        uri: String,
    },

    /// The SSH server refused or failed the forwarded channel
    #[error("ssh server {server} could not forward the connection: {message}{}", uri_suffix(.uri))]
    SshForward {
        /// SSH server address (`user@host:port`)
        server: String,
        /// Underlying failure
        message: String,
        /// Sanitized target URI
        uri: String,
    },

    /// Required configuration is missing or invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Authentication failure reported by the database
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Wire protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS negotiation or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid connection state transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state description
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Peer closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

fn uri_suffix(uri: &str) -> String {
    if uri.is_empty() {
        String::new()
    } else {
        format!(" ({})", uri)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Layer this error is attributed to
    pub fn layer(&self) -> Layer {
        match self {
            Error::Configuration(_) => Layer::Configuration,
            Error::ProxyConnect { .. } | Error::ProxyForward { .. } => Layer::Proxy,
            Error::SshConnect { .. } | Error::SshForward { .. } => Layer::Ssh,
            _ => Layer::Database,
        }
    }

    /// Whether the failure happened in a proxy or SSH hop
    pub fn is_tunnel_error(&self) -> bool {
        matches!(self.layer(), Layer::Proxy | Layer::Ssh)
    }

    /// Whether this is the timeout flavour of [`Error::DatabaseConnect`]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::DatabaseConnect { message, .. } if message == TIMED_OUT)
    }

    /// Replace the target URI carried by the error
    pub fn with_uri(mut self, target: &str) -> Self {
        match &mut self {
            Error::DatabaseConnect { uri, .. }
            | Error::ProxyConnect { uri, .. }
            | Error::ProxyForward { uri, .. }
            | Error::SshConnect { uri, .. }
            | Error::SshForward { uri, .. } => *uri = target.to_string(),
            _ => {}
        }
        self
    }

    /// Timeout raised when an attempt does not complete in time
    pub fn timed_out(uri: &str) -> Self {
        Error::DatabaseConnect {
            message: TIMED_OUT.to_string(),
            uri: uri.to_string(),
        }
    }
}

const TIMED_OUT: &str = "connection timed out";

/// Fold a driver failure into the public taxonomy.
///
/// Tunnel, configuration and already-classified database errors keep their variant and
/// receive the sanitized URI; everything else becomes [`Error::DatabaseConnect`].
pub fn classify_database(err: Error, uri: &str) -> Error {
    match err {
        Error::Configuration(_) => err,
        Error::DatabaseConnect { .. }
        | Error::ProxyConnect { .. }
        | Error::ProxyForward { .. }
        | Error::SshConnect { .. }
        | Error::SshForward { .. } => err.with_uri(uri),
        other => Error::DatabaseConnect {
            message: other.to_string(),
            uri: uri.to_string(),
        },
    }
}

/// Pick the error that best explains a failed attempt.
///
/// A proxy or SSH failure recorded during the attempt wins over the database error the
/// driver saw, since a broken tunnel usually surfaces to the driver as a closed socket.
pub fn prefer_root_cause(database: Error, tunnel: Option<Error>, uri: &str) -> Error {
    match tunnel {
        Some(tunnel) if tunnel.is_tunnel_error() => tunnel.with_uri(uri),
        _ => classify_database(database, uri),
    }
}

/// Classify a SOCKS5 handshake failure.
///
/// Reply failures and a socket closed mid-handshake mean the proxy is reachable but the
/// destination behind it is not; anything else points at the proxy itself.
pub(crate) fn classify_socks(err: tokio_socks::Error, proxy: &str, next: &str) -> Error {
    use tokio_socks::Error as Socks;

    let forward = match &err {
        Socks::GeneralSocksServerFailure
        | Socks::ConnectionNotAllowedByRuleset
        | Socks::NetworkUnreachable
        | Socks::HostUnreachable
        | Socks::ConnectionRefused
        | Socks::TtlExpired => true,
        Socks::Io(io_err) => is_socket_closed(io_err),
        _ => false,
    };

    if forward {
        Error::ProxyForward {
            proxy: proxy.to_string(),
            message: format!("{} (next hop {})", err, next),
            uri: String::new(),
        }
    } else {
        Error::ProxyConnect {
            proxy: proxy.to_string(),
            message: err.to_string(),
            uri: String::new(),
        }
    }
}

/// Failure reaching the proxy before any SOCKS bytes were exchanged
pub(crate) fn proxy_connect(proxy: &str, message: impl Into<String>) -> Error {
    Error::ProxyConnect {
        proxy: proxy.to_string(),
        message: message.into(),
        uri: String::new(),
    }
}

/// SSH connect or authentication failure
pub(crate) fn ssh_connect(server: &str, message: impl Into<String>) -> Error {
    Error::SshConnect {
        server: server.to_string(),
        message: message.into(),
        uri: String::new(),
    }
}

/// SSH forwarded-channel failure
pub(crate) fn ssh_forward(server: &str, message: impl Into<String>) -> Error {
    Error::SshForward {
        server: server.to_string(),
        message: message.into(),
        uri: String::new(),
    }
}

fn is_socket_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
