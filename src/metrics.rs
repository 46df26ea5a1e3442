//! Metrics emitted through the `metrics` facade
//!
//! No recorder is installed by this crate; applications choose one.

/// Label values
pub mod labels {
    /// SOCKS5 hop
    pub const HOP_SOCKS: &str = "socks5";
    /// SSH hop
    pub const HOP_SSH: &str = "ssh";
    /// Successful outcome
    pub const OUTCOME_OK: &str = "ok";
    /// Failed outcome
    pub const OUTCOME_ERROR: &str = "error";
    /// Cleartext password mechanism
    pub const MECHANISM_CLEARTEXT: &str = "cleartext";
    /// SCRAM-SHA-256 mechanism
    pub const MECHANISM_SCRAM: &str = "scram-sha-256";
}

/// Counters
pub mod counters {
    /// A hop finished connecting
    pub fn hop_connect(hop: &'static str, outcome: &'static str) {
        metrics::counter!("fraiseql_tunnel_hop_connects_total", "hop" => hop, "outcome" => outcome)
            .increment(1);
    }

    /// The local listener accepted a client
    pub fn listener_accepted() {
        metrics::counter!("fraiseql_tunnel_listener_accepted_total").increment(1);
    }

    /// A preferred-mode probe finished
    pub fn ssl_probe(mode: &'static str, outcome: &'static str) {
        metrics::counter!("fraiseql_tunnel_ssl_probes_total", "mode" => mode, "outcome" => outcome)
            .increment(1);
    }

    /// Authentication attempted with a mechanism
    pub fn auth_attempted(mechanism: &'static str) {
        metrics::counter!("fraiseql_tunnel_auth_attempted_total", "mechanism" => mechanism)
            .increment(1);
    }

    /// Authentication succeeded
    pub fn auth_successful(mechanism: &'static str) {
        metrics::counter!("fraiseql_tunnel_auth_successful_total", "mechanism" => mechanism)
            .increment(1);
    }
}

/// Histograms
pub mod histograms {
    /// Time spent establishing a full tunnel chain
    pub fn chain_connect_duration(hops: usize, millis: u64) {
        metrics::histogram!("fraiseql_tunnel_chain_connect_ms", "hops" => hops.to_string())
            .record(millis as f64);
    }

    /// Time spent authenticating against the database
    pub fn auth_duration(mechanism: &'static str, millis: u64) {
        metrics::histogram!("fraiseql_tunnel_auth_duration_ms", "mechanism" => mechanism)
            .record(millis as f64);
    }
}
