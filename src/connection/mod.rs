//! Bundled Postgres driver
//!
//! * SSL mode vocabulary and rustls configuration ([`SslMode`], [`TlsConfig`])
//! * TCP transport with in-place TLS upgrade
//! * Startup/authentication state machine
//! * [`PostgresDriver`], the [`crate::client::Driver`] used to probe live servers

mod conn;
mod state;
mod tls;
mod transport;

pub use conn::{PgConnection, PostgresDriver};
pub use state::ConnectionState;
pub use tls::{parse_server_name, SslMode, TlsConfig, TlsConfigBuilder};
pub use transport::Transport;
