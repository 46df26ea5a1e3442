//! Startup state machine for probe connections
//!
//! A probe connection only ever walks forward: optional TLS negotiation, startup,
//! authentication, ready. Closing is allowed from anywhere.

use crate::{Error, Result};

/// Phase of a [`PgConnection`](super::PgConnection)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open, nothing sent
    Initial,

    /// SSLRequest sent, waiting for `S` or `N`
    NegotiatingTls,

    /// StartupMessage sent
    AwaitingAuth,

    /// Authentication exchange running
    Authenticating,

    /// ReadyForQuery received
    Ready,

    /// Terminated or dropped
    Closed,
}

impl ConnectionState {
    /// Label used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::NegotiatingTls => "negotiating_tls",
            Self::AwaitingAuth => "awaiting_auth",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Closed => "closed",
        }
    }

    /// States reachable in one step, besides [`ConnectionState::Closed`]
    fn successors(&self) -> &'static [ConnectionState] {
        use ConnectionState::*;

        match self {
            Initial => &[NegotiatingTls, AwaitingAuth],
            NegotiatingTls => &[AwaitingAuth],
            AwaitingAuth => &[Authenticating],
            Authenticating => &[Ready],
            Ready | Closed => &[],
        }
    }

    /// Whether `next` follows this state
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        next == ConnectionState::Closed || self.successors().contains(&next)
    }

    /// Move to `next`, or fail with [`Error::InvalidState`]
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("a successor of {}", self),
                actual: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_plaintext_and_tls_paths() {
        for path in [
            &[AwaitingAuth, Authenticating, Ready][..],
            &[NegotiatingTls, AwaitingAuth, Authenticating, Ready][..],
        ] {
            let mut state = Initial;
            for next in path {
                state.transition(*next).unwrap();
            }
            assert_eq!(state, Ready);
        }
    }

    #[test]
    fn test_no_skipping_authentication() {
        let mut state = AwaitingAuth;
        let err = state.transition(Ready).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid state: expected a successor of awaiting_auth, got ready"
        );
        assert_eq!(state, AwaitingAuth);
    }

    #[test]
    fn test_close_from_anywhere() {
        for from in [Initial, NegotiatingTls, AwaitingAuth, Authenticating, Ready, Closed] {
            let mut state = from;
            assert!(state.transition(Closed).is_ok(), "{}", from);
        }
    }

    #[test]
    fn test_no_tls_after_ready() {
        assert!(!Ready.can_transition_to(NegotiatingTls));
        assert!(!Closed.can_transition_to(Initial));
    }
}
