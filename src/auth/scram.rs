//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677)
//!
//! Only the plain `SCRAM-SHA-256` mechanism is spoken. The GS2 header is always `n,,`
//! since the probe driver never advertises channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name sent in the SASL initial response
pub const MECHANISM: &str = "SCRAM-SHA-256";

const GS2_HEADER: &str = "n,,";
const NONCE_LEN: usize = 24;

/// SCRAM exchange failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScramError {
    /// The server signature did not match
    #[error("server signature verification failed")]
    InvalidServerSignature,

    /// The server sent a malformed message
    #[error("invalid server message: {0}")]
    InvalidServerMessage(String),

    /// A base64 field could not be decoded
    #[error("invalid base64 in {0}")]
    Base64(&'static str),
}

impl From<ScramError> for crate::Error {
    fn from(err: ScramError) -> Self {
        crate::Error::Authentication(err.to_string())
    }
}

/// Values retained between the client-final and server-final steps
#[derive(Clone, Debug)]
pub struct ScramState {
    auth_message: Vec<u8>,
    server_key: Vec<u8>,
}

/// One SCRAM-SHA-256 exchange
pub struct ScramClient {
    username: String,
    password: String,
    nonce: String,
}

impl std::fmt::Debug for ScramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramClient")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl ScramClient {
    /// Start an exchange with a fresh random nonce
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let mut rng = rand::thread_rng();
        let nonce_bytes: Vec<u8> = (0..NONCE_LEN).map(|_| rng.gen()).collect();
        Self::with_nonce(username, password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(
        username: impl Into<String>,
        password: impl Into<String>,
        nonce: String,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            nonce,
        }
    }

    fn client_first_bare(&self) -> String {
        // Postgres ignores the SCRAM user name and takes it from the startup packet.
        format!("n={},r={}", saslname(&self.username), self.nonce)
    }

    /// `client-first-message`
    pub fn client_first(&self) -> String {
        format!("{}{}", GS2_HEADER, self.client_first_bare())
    }

    /// Consume `server-first-message` and produce `client-final-message`
    pub fn client_final(&self, server_first: &str) -> Result<(String, ScramState), ScramError> {
        let first = ServerFirst::parse(server_first)?;

        if !first.nonce.starts_with(&self.nonce) || first.nonce.len() == self.nonce.len() {
            return Err(ScramError::InvalidServerMessage(
                "server nonce does not extend the client nonce".into(),
            ));
        }

        let salt = BASE64
            .decode(first.salt)
            .map_err(|_| ScramError::Base64("salt"))?;

        let without_proof = format!("c={},r={}", BASE64.encode(GS2_HEADER), first.nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let mut salted = [0u8; 32];
        pbkdf2::<HmacSha256>(self.password.as_bytes(), &salt, first.iterations, &mut salted)
            .map_err(|_| ScramError::InvalidServerMessage("invalid pbkdf2 parameters".into()))?;

        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);
        let signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let state = ScramState {
            auth_message: auth_message.into_bytes(),
            server_key: hmac(&salted, b"Server Key")?,
        };

        Ok((
            format!("{},p={}", without_proof, BASE64.encode(proof)),
            state,
        ))
    }

    /// Check `server-final-message`
    pub fn verify_server_final(
        &self,
        server_final: &str,
        state: &ScramState,
    ) -> Result<(), ScramError> {
        if let Some(reason) = server_final.strip_prefix("e=") {
            return Err(ScramError::InvalidServerMessage(reason.to_string()));
        }
        let encoded = server_final
            .strip_prefix("v=")
            .ok_or_else(|| ScramError::InvalidServerMessage("missing 'v=' prefix".into()))?;
        let received = BASE64
            .decode(encoded.trim_end())
            .map_err(|_| ScramError::Base64("server signature"))?;

        let expected = hmac(&state.server_key, &state.auth_message)?;
        if constant_time_eq(&received, &expected) {
            Ok(())
        } else {
            Err(ScramError::InvalidServerSignature)
        }
    }
}

struct ServerFirst<'a> {
    nonce: &'a str,
    salt: &'a str,
    iterations: u32,
}

impl<'a> ServerFirst<'a> {
    fn parse(msg: &'a str) -> Result<Self, ScramError> {
        let (mut nonce, mut salt, mut iterations) = (None, None, None);

        for part in msg.split(',') {
            match part.split_once('=') {
                Some(("r", v)) if !v.is_empty() => nonce = Some(v),
                Some(("s", v)) if !v.is_empty() => salt = Some(v),
                Some(("i", v)) if !v.is_empty() => iterations = Some(v),
                _ => {}
            }
        }

        let missing = |field: &str| {
            ScramError::InvalidServerMessage(format!("server-first-message lacks '{}'", field))
        };
        let iterations = iterations
            .ok_or_else(|| missing("i"))?
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ScramError::InvalidServerMessage("invalid iteration count".into()))?;

        Ok(Self {
            nonce: nonce.ok_or_else(|| missing("r"))?,
            salt: salt.ok_or_else(|| missing("s"))?,
            iterations,
        })
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ScramError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| ScramError::InvalidServerMessage("invalid HMAC key".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn saslname(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
