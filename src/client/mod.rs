//! Connection options, dialects and SSL-mode negotiation
//!
//! * [`ConnectionOptions`] accepts a URI or structured fields and resolves them
//! * [`Dialect`] maps each SQL dialect to its default port and TLS option shape
//! * [`ConnectionNegotiator`] builds the tunnel, probes `sslmode=preferred` and drives a [`Driver`]

mod connection_string;
mod dialect;
mod driver;
mod negotiator;
mod options;

pub use connection_string::{invalid_uri, sanitize_uri, ConnectionUri, SANITIZED_PASSWORD};
pub use dialect::{Dialect, DialectProfile, TlsOptions};
pub use driver::{Driver, DriverConfig};
pub use negotiator::{ConnectionNegotiator, Established, NegotiatorConfig, SKIP_VERIFY_ENV};
pub use options::{
    ConnectionOptions, ConnectionOptionsBuilder, ResolvedOptions, Target, TargetFields,
};

pub use crate::tunnel::{ProxyConfig, SshConfig};
