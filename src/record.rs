//! Peer records and session identities.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::domain::TopicKey;

/// Random per-session token used to keep a session from discovering itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 32]);

impl SessionId {
    /// Generate a fresh random identity.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Wrap raw identity bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw identity bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(&self.0[..4]))
    }
}

/// A peer discovered for a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Peer host.
    pub host: IpAddr,
    /// Peer port.
    pub port: u16,
    /// Found on the local network (LAN multicast or DHT local-peer list).
    pub local: bool,
    /// DHT node that reported this peer. Always `None` for LAN peers.
    pub referrer: Option<SocketAddr>,
    /// Topic the peer was found for.
    pub topic: TopicKey,
    /// Local endpoint the reply arrived on, when the transport reports it.
    pub to: Option<SocketAddr>,
}

impl PeerRecord {
    /// A peer found through LAN multicast.
    pub(crate) fn multicast(addr: SocketAddr, topic: TopicKey) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
            local: true,
            referrer: None,
            topic,
            to: None,
        }
    }

    /// A peer from a DHT reply.
    pub(crate) fn dht(
        addr: SocketAddr,
        topic: TopicKey,
        referrer: Option<SocketAddr>,
        to: Option<SocketAddr>,
    ) -> Self {
        Self {
            host: addr.ip(),
            port: addr.port(),
            local: referrer.is_none(),
            referrer,
            topic,
            to,
        }
    }

    /// `host:port` of the peer.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::random(), SessionId::random());
    }

    #[test]
    fn dht_record_locality_follows_referrer() {
        let topic = TopicKey::from_bytes([1u8; 32]);
        let addr: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let node: SocketAddr = "1.2.3.4:49737".parse().unwrap();

        let remote = PeerRecord::dht(addr, topic, Some(node), None);
        assert!(!remote.local);
        assert_eq!(remote.referrer, Some(node));

        let local = PeerRecord::dht(addr, topic, None, None);
        assert!(local.local);
        assert_eq!(local.addr(), addr);
    }
}
