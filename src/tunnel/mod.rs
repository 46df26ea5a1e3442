//! Tunnel composition
//!
//! * [`TunnelService`] is the hop contract; [`SocksHop`] and [`SshHop`] implement it
//! * [`TunnelPlan`] describes the hops, [`TunnelChain`] instantiates them for one socket
//! * [`LocalListener`] exposes a plan on a loopback port

mod chain;
mod listener;
mod service;
mod socks;
mod ssh;

pub use chain::{HopConfig, TunnelChain, TunnelPlan};
pub use listener::LocalListener;
pub use service::{
    AsyncStream, Cancellable, Endpoint, HopState, SocketCounter, Tracked, TunnelService,
    TunnelStream,
};
pub use socks::{ProxyConfig, SocksHop, HANDSHAKE_TIMEOUT};
pub use ssh::{SshChannel, SshConfig, SshHop};
