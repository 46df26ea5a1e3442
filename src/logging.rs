//! Logging sink collaborator
//!
//! The negotiator reports warnings (ignored TLS options, probe failures) as plain
//! `(level, message)` pairs. The default sink forwards them to `tracing`.

use std::sync::Arc;
use tracing::Level;

/// Receives `(level, message)` pairs from the negotiator
pub trait LogSink: Send + Sync {
    /// Record one message
    fn log(&self, level: Level, message: &str);
}

/// Forwards every message to the matching `tracing` macro
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!("{}", message),
            Level::WARN => tracing::warn!("{}", message),
            Level::INFO => tracing::info!("{}", message),
            Level::DEBUG => tracing::debug!("{}", message),
            Level::TRACE => tracing::trace!("{}", message),
        }
    }
}

impl<F> LogSink for F
where
    F: Fn(Level, &str) + Send + Sync,
{
    fn log(&self, level: Level, message: &str) {
        self(level, message)
    }
}

/// Shared sink handle
pub type SharedSink = Arc<dyn LogSink>;

/// Default sink
pub fn default_sink() -> SharedSink {
    Arc::new(TracingSink)
}
