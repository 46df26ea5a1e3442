//! Server replies seen before `ReadyForQuery`

use bytes::{Buf, Bytes, BytesMut};
use std::io;

/// Answer to SSLRequest: go ahead with the TLS handshake
pub const TLS_ACCEPTED: u8 = b'S';

/// Answer to SSLRequest: TLS unavailable
pub const TLS_REFUSED: u8 = b'N';

/// Startup replies are small; a huge length field means garbage on the wire.
const MAX_REPLY_LEN: usize = 1 << 20;

fn invalid(what: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what.into())
}

/// What the server asks for during authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    /// Login accepted
    Ok,
    /// Send the password in clear
    Cleartext,
    /// MD5 challenge (not supported)
    Md5,
    /// SASL, with the mechanisms offered
    Sasl(Vec<String>),
    /// SASL server-first message
    SaslContinue(Bytes),
    /// SASL server-final message
    SaslFinal(Bytes),
}

/// ErrorResponse / NoticeResponse fields the driver cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerNotice {
    /// `S`
    pub severity: Option<String>,
    /// `C`, the SQLSTATE
    pub code: Option<String>,
    /// `M`
    pub message: Option<String>,
    /// `D`
    pub detail: Option<String>,
}

impl ServerNotice {
    /// SQLSTATE class 28, invalid authorization specification
    pub fn is_auth_failure(&self) -> bool {
        self.code.as_deref().is_some_and(|code| code.starts_with("28"))
    }
}

impl std::fmt::Display for ServerNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message.as_deref().unwrap_or("server error"))?;
        if let Some(code) = &self.code {
            write!(f, " ({})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// One startup-phase server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `R`
    Auth(AuthRequest),
    /// `K`
    KeyData {
        /// Backend process id
        process_id: i32,
        /// Cancellation secret
        secret_key: i32,
    },
    /// `S`
    Parameter {
        /// Parameter name
        name: String,
        /// Current value
        value: String,
    },
    /// `N`
    Notice(ServerNotice),
    /// `E`
    Error(ServerNotice),
    /// `Z`, with the transaction status byte
    Ready(u8),
}

struct Body(Bytes);

impl Body {
    fn i32(&mut self, what: &str) -> io::Result<i32> {
        if self.0.remaining() < 4 {
            return Err(invalid(format!("truncated {}", what)));
        }
        Ok(self.0.get_i32())
    }

    fn cstr(&mut self, what: &str) -> io::Result<String> {
        let end = self
            .0
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| invalid(format!("unterminated {}", what)))?;
        let raw = self.0.split_to(end);
        self.0.advance(1);
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn rest(self) -> Bytes {
        self.0
    }
}

impl Reply {
    /// Parse the body of a message tagged `tag`
    pub fn parse(tag: u8, body: Bytes) -> io::Result<Self> {
        let mut body = Body(body);
        let reply = match tag {
            b'R' => Self::Auth(match body.i32("auth request")? {
                0 => AuthRequest::Ok,
                3 => AuthRequest::Cleartext,
                5 => AuthRequest::Md5,
                10 => {
                    let mut mechanisms = Vec::new();
                    while !body.0.is_empty() {
                        let name = body.cstr("SASL mechanism")?;
                        if name.is_empty() {
                            break;
                        }
                        mechanisms.push(name);
                    }
                    AuthRequest::Sasl(mechanisms)
                }
                11 => AuthRequest::SaslContinue(body.rest()),
                12 => AuthRequest::SaslFinal(body.rest()),
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("unsupported auth request {}", other),
                    ))
                }
            }),
            b'K' => Self::KeyData {
                process_id: body.i32("backend key data")?,
                secret_key: body.i32("backend key data")?,
            },
            b'S' => Self::Parameter {
                name: body.cstr("parameter name")?,
                value: body.cstr("parameter value")?,
            },
            b'E' => Self::Error(notice(body)?),
            b'N' => Self::Notice(notice(body)?),
            b'Z' => match body.0.first() {
                Some(status) => Self::Ready(*status),
                None => return Err(invalid("truncated ReadyForQuery")),
            },
            other => {
                return Err(invalid(format!(
                    "unexpected message {:?} during startup",
                    other as char
                )))
            }
        };
        Ok(reply)
    }
}

fn notice(mut body: Body) -> io::Result<ServerNotice> {
    let mut notice = ServerNotice::default();
    while let Some(&field) = body.0.first() {
        body.0.advance(1);
        if field == 0 {
            break;
        }
        let value = body.cstr("notice field")?;
        match field {
            b'S' => notice.severity = Some(value),
            b'C' => notice.code = Some(value),
            b'M' => notice.message = Some(value),
            b'D' => notice.detail = Some(value),
            _ => {}
        }
    }
    Ok(notice)
}

/// Take the next complete reply off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed; nothing is consumed in that case.
pub fn next_reply(buf: &mut BytesMut) -> io::Result<Option<Reply>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let tag = buf[0];
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let len = usize::try_from(len)
        .ok()
        .filter(|len| (4..=MAX_REPLY_LEN).contains(len))
        .ok_or_else(|| invalid(format!("bad length {} for message {:?}", len, tag as char)))?;

    if buf.len() < 1 + len {
        return Ok(None);
    }
    let mut frame = buf.split_to(1 + len);
    frame.advance(5);
    Reply::parse(tag, frame.freeze()).map(Some)
}
