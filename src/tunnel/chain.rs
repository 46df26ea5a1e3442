//! Hop plans and per-connection chains

use super::service::{Endpoint, SocketCounter, TunnelService, TunnelStream};
use super::socks::{ProxyConfig, SocksHop};
use super::ssh::{SshConfig, SshHop};
use crate::{Error, Result};
use std::time::Instant;

/// Descriptor for one hop
#[derive(Debug, Clone)]
pub enum HopConfig {
    /// SOCKS5 proxy
    Socks(ProxyConfig),
    /// SSH jump host
    Ssh(SshConfig),
}

impl HopConfig {
    /// Server the hop dials
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::Socks(config) => config.endpoint(),
            Self::Ssh(config) => config.endpoint(),
        }
    }

    fn build(&self, sockets: &SocketCounter) -> Box<dyn TunnelService> {
        match self {
            Self::Socks(config) => Box::new(SocksHop::new(config.clone(), sockets.clone())),
            Self::Ssh(config) => Box::new(SshHop::new(config.clone(), sockets.clone())),
        }
    }
}

/// Immutable, ordered list of hops towards one target.
///
/// A plan is built once per logical request; [`TunnelPlan::build`] turns it into a fresh
/// [`TunnelChain`] for every physical connection.
#[derive(Debug, Clone)]
pub struct TunnelPlan {
    hops: Vec<HopConfig>,
    target: Endpoint,
}

impl TunnelPlan {
    /// Plan with no hops yet
    pub fn new(target: Endpoint) -> Self {
        Self {
            hops: Vec::new(),
            target,
        }
    }

    /// Append a hop; the first hop added is dialled first
    pub fn hop(mut self, hop: HopConfig) -> Self {
        self.hops.push(hop);
        self
    }

    /// Plan for the usual proxy/ssh combination: SOCKS5 first, SSH over it
    pub fn from_parts(target: Endpoint, proxy: Option<ProxyConfig>, ssh: Option<SshConfig>) -> Self {
        let mut plan = Self::new(target);
        if let Some(proxy) = proxy {
            plan = plan.hop(HopConfig::Socks(proxy));
        }
        if let Some(ssh) = ssh {
            plan = plan.hop(HopConfig::Ssh(ssh));
        }
        plan
    }

    /// Hop descriptors in dial order
    pub fn hops(&self) -> &[HopConfig] {
        &self.hops
    }

    /// Final destination
    pub fn target(&self) -> &Endpoint {
        &self.target
    }

    /// Whether the plan has no hops
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Fresh chain reporting sockets to `sockets`
    pub fn build(&self, sockets: SocketCounter) -> TunnelChain {
        TunnelChain {
            hops: self.hops.iter().map(|hop| hop.build(&sockets)).collect(),
            target: self.target.clone(),
        }
    }
}

/// Hops instantiated for a single physical connection. Never reused.
pub struct TunnelChain {
    hops: Vec<Box<dyn TunnelService>>,
    target: Endpoint,
}

impl std::fmt::Debug for TunnelChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hops: Vec<String> = self.hops.iter().map(|h| h.address()).collect();
        f.debug_struct("TunnelChain")
            .field("hops", &hops)
            .field("target", &self.target)
            .finish()
    }
}

impl TunnelChain {
    /// Wrap already-built hops
    pub fn new(hops: Vec<Box<dyn TunnelService>>, target: Endpoint) -> Self {
        Self { hops, target }
    }

    /// Endpoint hop `index` must reach
    fn next_endpoint(&self, index: usize) -> Endpoint {
        self.hops
            .get(index + 1)
            .map(|hop| hop.endpoint())
            .unwrap_or_else(|| self.target.clone())
    }

    /// Thread each hop's output into the next and return the stream reaching the target
    pub async fn connect(&self) -> Result<TunnelStream> {
        let started = Instant::now();
        let mut stream: Option<TunnelStream> = None;

        for (index, hop) in self.hops.iter().enumerate() {
            let next = self.next_endpoint(index);
            stream = Some(hop.connect(stream.take(), &next).await?);
        }

        let stream = stream
            .ok_or_else(|| Error::Configuration("tunnel chain has no hops".into()))?;
        crate::metrics::histograms::chain_connect_duration(
            self.hops.len(),
            started.elapsed().as_millis() as u64,
        );
        tracing::debug!(target = %self.target, hops = self.hops.len(), "tunnel established");
        Ok(stream)
    }

    /// Stop every hop
    pub fn stop(&self) {
        for hop in &self.hops {
            hop.stop();
        }
    }

    /// First error recorded by the hop closest to the client
    pub fn last_error(&self) -> Option<Error> {
        self.hops.iter().find_map(|hop| hop.last_error())
    }

    /// Whether any hop failed
    pub fn has_failed(&self) -> bool {
        self.hops.iter().any(|hop| hop.has_failed())
    }

    /// Number of hops
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Whether the chain has no hops
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records the endpoint it was asked to reach and passes a duplex stream on
    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<(&'static str, bool, Endpoint)>>>,
        stopped: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl TunnelService for Recorder {
        async fn connect(
            &self,
            inbound: Option<TunnelStream>,
            next: &Endpoint,
        ) -> Result<TunnelStream> {
            self.seen
                .lock()
                .push((self.name, inbound.is_some(), next.clone()));
            let (a, _b) = tokio::io::duplex(16);
            Ok(Box::new(a))
        }

        fn stop(&self) {
            *self.stopped.lock() += 1;
        }

        fn last_error(&self) -> Option<Error> {
            None
        }

        fn endpoint(&self) -> Endpoint {
            Endpoint::new(self.name, 1)
        }

        fn address(&self) -> String {
            self.name.to_string()
        }
    }

    #[tokio::test]
    async fn test_chain_threads_streams_and_endpoints() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(Mutex::new(0));
        let hop = |name| -> Box<dyn TunnelService> {
            Box::new(Recorder {
                name,
                seen: seen.clone(),
                stopped: stopped.clone(),
            })
        };

        let chain = TunnelChain::new(vec![hop("proxy"), hop("bastion")], Endpoint::new("db", 5432));
        chain.connect().await.unwrap();

        let seen = seen.lock().clone();
        assert_eq!(seen[0], ("proxy", false, Endpoint::new("bastion", 1)));
        assert_eq!(seen[1], ("bastion", true, Endpoint::new("db", 5432)));

        chain.stop();
        chain.stop();
        assert_eq!(*stopped.lock(), 4);
    }

    #[tokio::test]
    async fn test_empty_chain_is_configuration_error() {
        let chain = TunnelChain::new(Vec::new(), Endpoint::new("db", 5432));
        assert!(matches!(
            chain.connect().await,
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_plan_orders_socks_before_ssh() {
        let plan = TunnelPlan::from_parts(
            Endpoint::new("db", 5432),
            Some(ProxyConfig::new("proxy", 1080)),
            Some(SshConfig::new("bastion", "deploy", "key")),
        );
        assert!(matches!(plan.hops()[0], HopConfig::Socks(_)));
        assert!(matches!(plan.hops()[1], HopConfig::Ssh(_)));

        let chain = plan.build(SocketCounter::new());
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.next_endpoint(0), Endpoint::new("bastion", 22));
        assert_eq!(chain.next_endpoint(1), Endpoint::new("db", 5432));
    }
}
