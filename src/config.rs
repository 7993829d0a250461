//! Configuration for the registry, its collaborators, and topic sessions.

use std::net::SocketAddr;
use std::time::Duration;

use crate::domain::DEFAULT_DOMAIN_SUFFIX;

/// Early-stabilization thresholds for a DHT round.
///
/// These are tuned values, not protocol invariants. A round is considered
/// flushed once the largest reply seen so far has been matched or exceeded
/// `repeat_threshold` times. Replies with `saturation_cap` peers or more
/// are ignored since a full reply says nothing about convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stabilization {
    /// Repeats of the maximum reply size needed to flush early. Default: 6.
    pub repeat_threshold: usize,
    /// Reply sizes at or above this are ignored. Default: 16.
    pub saturation_cap: usize,
}

impl Default for Stabilization {
    fn default() -> Self {
        Self {
            repeat_threshold: 6,
            saturation_cap: 16,
        }
    }
}

/// Registry-level configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Suffix appended to every domain name. Default: `hyperswarm.local`.
    pub domain_suffix: String,
    /// Base delay between DHT rounds. Default: 5 minutes.
    pub dht_interval: Duration,
    /// Base delay between multicast queries. Default: 30 seconds.
    pub multicast_interval: Duration,
    /// Early-stabilization thresholds.
    pub stabilization: Stabilization,
    /// Append the querier's observed address to multicast answers.
    pub multicast_referrer: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            domain_suffix: DEFAULT_DOMAIN_SUFFIX.to_string(),
            dht_interval: Duration::from_secs(300),
            multicast_interval: Duration::from_secs(30),
            stabilization: Stabilization::default(),
            multicast_referrer: false,
        }
    }
}

impl DiscoveryConfig {
    /// Set the domain suffix.
    pub fn domain_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.domain_suffix = suffix.into();
        self
    }

    /// Set the base DHT round delay.
    pub fn dht_interval(mut self, d: Duration) -> Self {
        self.dht_interval = d;
        self
    }

    /// Set the base multicast query delay.
    pub fn multicast_interval(mut self, d: Duration) -> Self {
        self.multicast_interval = d;
        self
    }

    /// Set the early-stabilization thresholds.
    pub fn stabilization(mut self, s: Stabilization) -> Self {
        self.stabilization = s;
        self
    }

    /// Enable or disable referrer records in multicast answers.
    pub fn multicast_referrer(mut self, enabled: bool) -> Self {
        self.multicast_referrer = enabled;
        self
    }
}

/// Options handed to a DHT client constructor.
#[derive(Debug, Clone)]
pub struct DhtOptions {
    /// Bootstrap nodes used to join (or query) the DHT.
    pub bootstrap: Vec<SocketAddr>,
    /// Short-lived node that queries but does not join the routing table.
    /// Default: true.
    pub ephemeral: bool,
}

impl Default for DhtOptions {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            ephemeral: true,
        }
    }
}

impl DhtOptions {
    /// Set the bootstrap nodes.
    pub fn bootstrap<I>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        self.bootstrap = nodes.into_iter().collect();
        self
    }

    /// Set the ephemeral flag.
    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }
}

/// Options for [`Discovery::announce`](crate::Discovery::announce).
#[derive(Debug, Clone, Default)]
pub struct AnnounceOptions {
    /// Port to announce on the DHT. 0 lets the DHT client use its own port.
    pub port: u16,
    /// Port to advertise on the LAN. Falls back to `port`.
    pub local_port: Option<u16>,
    /// Also look up peers for the topic.
    pub lookup: bool,
    /// LAN address to announce alongside the public one.
    pub local_address: Option<SocketAddr>,
}

impl AnnounceOptions {
    /// Announce the given port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Set the LAN port.
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Also look up peers.
    pub fn lookup(mut self, lookup: bool) -> Self {
        self.lookup = lookup;
        self
    }

    /// Set the LAN address.
    pub fn local_address(mut self, addr: SocketAddr) -> Self {
        self.local_address = Some(addr);
        self
    }

    /// Port advertised in multicast answers, if any.
    pub(crate) fn advertised_port(&self) -> Option<u16> {
        match self.local_port.filter(|p| *p != 0).unwrap_or(self.port) {
            0 => None,
            port => Some(port),
        }
    }
}

/// Options for [`Discovery::lookup`](crate::Discovery::lookup).
///
/// Forwarded to the DHT client untouched.
#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    /// LAN address of the requester, used by the DHT to report local peers.
    pub local_address: Option<SocketAddr>,
}

/// Options for [`Discovery::destroy`](crate::Discovery::destroy).
#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyOptions {
    /// Skip waiting for topics to unannounce before tearing down the DHT.
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(cfg.domain_suffix, "hyperswarm.local");
        assert_eq!(cfg.dht_interval, Duration::from_secs(300));
        assert_eq!(cfg.multicast_interval, Duration::from_secs(30));
        assert_eq!(cfg.stabilization.repeat_threshold, 6);
        assert_eq!(cfg.stabilization.saturation_cap, 16);
        assert!(!cfg.multicast_referrer);
        assert!(DhtOptions::default().ephemeral);
    }

    #[test]
    fn advertised_port_prefers_local_port() {
        assert_eq!(AnnounceOptions::new(1000).advertised_port(), Some(1000));
        assert_eq!(
            AnnounceOptions::new(1000).local_port(2000).advertised_port(),
            Some(2000)
        );
        assert_eq!(AnnounceOptions::new(0).advertised_port(), None);
    }
}
