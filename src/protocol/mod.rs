//! Startup-phase Postgres wire codec
//!
//! A probe connection never issues queries. It may ask for TLS, sends a startup packet,
//! answers the authentication exchange and stops at `ReadyForQuery`, so only those
//! messages are understood here. Anything else from the server is a protocol error.

pub mod backend;
pub mod frontend;

pub use backend::{next_reply, AuthRequest, Reply, ServerNotice};
