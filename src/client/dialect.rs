//! SQL dialects and their static connection profiles

use crate::connection::SslMode;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported SQL dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL
    Postgres,
    /// MySQL
    Mysql,
    /// MariaDB
    Mariadb,
    /// Microsoft SQL Server
    Mssql,
    /// IBM Db2
    Db2,
}

/// Driver-level TLS options built for a concrete [`SslMode`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "options", rename_all = "camelCase")]
pub enum TlsOptions {
    /// Plaintext connection
    Disabled,
    /// `ssl: { rejectUnauthorized }` style (Postgres, MySQL, MariaDB)
    #[serde(rename_all = "camelCase")]
    Ssl {
        /// Verify the server certificate chain and host name
        reject_unauthorized: bool,
    },
    /// `encrypt` / `trustServerCertificate` style (SQL Server)
    #[serde(rename_all = "camelCase")]
    Encrypt {
        /// Negotiate TLS
        encrypt: bool,
        /// Skip certificate verification
        trust_server_certificate: bool,
    },
    /// Caller-supplied options passed through untouched
    Manual(serde_json::Value),
}

impl TlsOptions {
    /// Whether these options ask the driver for an encrypted channel
    pub fn uses_tls(&self) -> bool {
        match self {
            Self::Disabled => false,
            Self::Ssl { .. } => true,
            Self::Encrypt { encrypt, .. } => *encrypt,
            Self::Manual(value) => !matches!(value, serde_json::Value::Null | serde_json::Value::Bool(false)),
        }
    }
}

/// Static per-dialect table entry
#[derive(Debug)]
pub struct DialectProfile {
    /// URI scheme and display name
    pub name: &'static str,
    /// Port used when the caller omits one
    pub default_port: Option<u16>,
    tls: Option<fn(SslMode) -> TlsOptions>,
}

impl DialectProfile {
    /// Build TLS options for a concrete mode.
    ///
    /// Returns `None` when the dialect has no TLS mapping or `mode` is not one of
    /// `Disabled`, `Required`, `Verify`.
    pub fn tls_options(&self, mode: SslMode) -> Option<TlsOptions> {
        match mode {
            SslMode::Disabled | SslMode::Required | SslMode::Verify => self.tls.map(|f| f(mode)),
            SslMode::Manual | SslMode::Preferred => None,
        }
    }

    /// Whether the dialect maps `sslMode` values at all
    pub fn supports_tls(&self) -> bool {
        self.tls.is_some()
    }
}

fn ssl_object(mode: SslMode) -> TlsOptions {
    match mode {
        SslMode::Required => TlsOptions::Ssl {
            reject_unauthorized: false,
        },
        SslMode::Verify => TlsOptions::Ssl {
            reject_unauthorized: true,
        },
        _ => TlsOptions::Disabled,
    }
}

fn encrypt_flags(mode: SslMode) -> TlsOptions {
    TlsOptions::Encrypt {
        encrypt: mode.uses_tls(),
        trust_server_certificate: !mode.requires_verification(),
    }
}

static POSTGRES: DialectProfile = DialectProfile {
    name: "postgres",
    default_port: Some(5432),
    tls: Some(ssl_object),
};

static MYSQL: DialectProfile = DialectProfile {
    name: "mysql",
    default_port: Some(3306),
    tls: Some(ssl_object),
};

static MARIADB: DialectProfile = DialectProfile {
    name: "mariadb",
    default_port: Some(3306),
    tls: Some(ssl_object),
};

static MSSQL: DialectProfile = DialectProfile {
    name: "mssql",
    default_port: Some(1433),
    tls: Some(encrypt_flags),
};

static DB2: DialectProfile = DialectProfile {
    name: "db2",
    default_port: None,
    tls: None,
};

impl Dialect {
    /// Every supported dialect
    pub const ALL: [Dialect; 5] = [
        Dialect::Postgres,
        Dialect::Mysql,
        Dialect::Mariadb,
        Dialect::Mssql,
        Dialect::Db2,
    ];

    /// Static profile for this dialect
    pub fn profile(&self) -> &'static DialectProfile {
        match self {
            Self::Postgres => &POSTGRES,
            Self::Mysql => &MYSQL,
            Self::Mariadb => &MARIADB,
            Self::Mssql => &MSSQL,
            Self::Db2 => &DB2,
        }
    }

    /// Canonical name (also the URI scheme)
    pub fn name(&self) -> &'static str {
        self.profile().name
    }

    /// Port used when none is given
    pub fn default_port(&self) -> Option<u16> {
        self.profile().default_port
    }

    /// Resolve an explicit port or fall back to the dialect default
    pub fn resolve_port(&self, port: Option<u16>) -> Result<u16> {
        port.or(self.default_port()).ok_or_else(|| {
            Error::Configuration(format!(
                "port is required for dialect {}, which has no default port",
                self.name()
            ))
        })
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "mariadb" => Ok(Self::Mariadb),
            "mssql" | "sqlserver" => Ok(Self::Mssql),
            "db2" => Ok(Self::Db2),
            other => Err(Error::Configuration(format!(
                "unsupported dialect: {}",
                other
            ))),
        }
    }
}
