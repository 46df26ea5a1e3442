//! Driver transport (plain TCP with optional TLS upgrade)

use crate::{Error, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// TCP stream, plain or TLS-encrypted
#[allow(clippy::large_enum_variant)]
pub enum Transport {
    /// Plain TCP connection
    Plain(TcpStream),
    /// TLS-encrypted TCP connection
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
    /// Placeholder while the socket is moved into a TLS upgrade
    Detached,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain(TcpStream)"),
            Transport::Tls(_) => f.write_str("Transport::Tls(TlsStream)"),
            Transport::Detached => f.write_str("Transport::Detached"),
        }
    }
}

impl Transport {
    /// Connect via plain TCP
    pub async fn connect_tcp(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Transport::Plain(stream))
    }

    /// Whether the transport is TLS-encrypted
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Upgrade a plain TCP transport to TLS after SSLRequest negotiation.
    ///
    /// `server_name` is the real database host, which differs from the dialled host
    /// when the connection goes through the local tunnel entry point.
    pub async fn upgrade_to_tls(
        self,
        tls_config: &crate::connection::TlsConfig,
        server_name: &str,
    ) -> Result<Self> {
        match self {
            Transport::Plain(tcp_stream) => {
                let name = crate::connection::parse_server_name(server_name)?;
                let name = rustls_pki_types::ServerName::try_from(name).map_err(|_| {
                    Error::Configuration(format!("Invalid hostname for TLS: {}", server_name))
                })?;

                let connector = tokio_rustls::TlsConnector::from(tls_config.client_config());
                let tls_stream = connector
                    .connect(name, tcp_stream)
                    .await
                    .map_err(|e| Error::Tls(format!("TLS handshake failed: {}", e)))?;

                Ok(Transport::Tls(tls_stream))
            }
            Transport::Tls(_) => Err(Error::Tls("transport is already TLS-encrypted".into())),
            Transport::Detached => Err(Error::ConnectionClosed),
        }
    }

    /// Write all bytes to the transport
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.write_all(buf).await?,
            Transport::Tls(stream) => stream.write_all(buf).await?,
            Transport::Detached => return Err(Error::ConnectionClosed),
        }
        Ok(())
    }

    /// Flush the transport
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush().await?,
            Transport::Tls(stream) => stream.flush().await?,
            Transport::Detached => return Err(Error::ConnectionClosed),
        }
        Ok(())
    }

    /// Read bytes into buffer
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = match self {
            Transport::Plain(stream) => stream.read_buf(buf).await?,
            Transport::Tls(stream) => stream.read_buf(buf).await?,
            Transport::Detached => return Err(Error::ConnectionClosed),
        };
        Ok(n)
    }

    /// Shutdown the transport
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.shutdown().await?,
            Transport::Tls(stream) => stream.shutdown().await?,
            Transport::Detached => return Err(Error::ConnectionClosed),
        }
        Ok(())
    }
}
