//! DHT collaborator contract.
//!
//! The registry drives one [`DhtClient`] shared by every topic. Routing,
//! RPC, and NAT traversal live behind this trait.

pub mod memory;

use std::net::SocketAddr;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::config::LookupOptions;
use crate::domain::TopicKey;
use crate::record::PeerRecord;
use crate::Result;

/// One reply from a DHT node during an announce or lookup.
#[derive(Debug, Clone, Default)]
pub struct DhtReply {
    /// The node that sent this reply.
    pub node: Option<SocketAddr>,
    /// Peers reachable over the internet.
    pub peers: Vec<SocketAddr>,
    /// Peers that share our public address and announced a LAN address.
    pub local_peers: Vec<SocketAddr>,
    /// Local endpoint the reply arrived on.
    pub to: Option<SocketAddr>,
}

impl DhtReply {
    /// Translate the reply into peer records for `topic`.
    pub fn into_records(self, topic: TopicKey) -> impl Iterator<Item = PeerRecord> {
        let to = self.to;
        let node = self.node;
        let local = self
            .local_peers
            .into_iter()
            .map(move |addr| PeerRecord::dht(addr, topic, None, to));
        let remote = self
            .peers
            .into_iter()
            .map(move |addr| PeerRecord {
                local: false,
                ..PeerRecord::dht(addr, topic, node, to)
            });
        local.chain(remote)
    }
}

/// What a topic asks the DHT to announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceConfig {
    /// Announced port. 0 means the client's own port.
    pub port: u16,
    /// LAN address for peers behind the same NAT.
    pub local_address: Option<SocketAddr>,
}

/// Stream of replies for one announce or lookup round.
pub type PeerStream = Pin<Box<dyn Stream<Item = Result<DhtReply>> + Send>>;

/// A DHT client as consumed by the discovery registry.
#[async_trait]
pub trait DhtClient: Send + Sync + 'static {
    /// Announce `key` and stream back the peers found along the way.
    fn announce(&self, key: &TopicKey, config: &AnnounceConfig) -> PeerStream;

    /// Look up peers for `key`.
    fn lookup(&self, key: &TopicKey, options: &LookupOptions) -> PeerStream;

    /// Withdraw a previous announcement.
    async fn unannounce(&self, key: &TopicKey, config: &AnnounceConfig) -> Result<()>;

    /// Ping a node. Returns our address as observed by that node.
    async fn ping(&self, node: SocketAddr) -> Result<SocketAddr>;

    /// Punch a hole to a peer through its referrer.
    async fn holepunch(&self, peer: &PeerRecord) -> Result<()>;

    /// Bootstrap nodes this client was configured with.
    fn bootstrap_nodes(&self) -> Vec<SocketAddr>;

    /// Whether the client runs in ephemeral mode.
    fn ephemeral(&self) -> bool;

    /// Release the client.
    async fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_translates_local_then_remote() {
        let topic = TopicKey::from_bytes([9u8; 32]);
        let node: SocketAddr = "1.1.1.1:49737".parse().unwrap();
        let reply = DhtReply {
            node: Some(node),
            peers: vec!["2.2.2.2:1000".parse().unwrap()],
            local_peers: vec!["192.168.1.5:1001".parse().unwrap()],
            to: None,
        };

        let records: Vec<_> = reply.into_records(topic).collect();
        assert_eq!(records.len(), 2);

        assert!(records[0].local);
        assert_eq!(records[0].referrer, None);
        assert_eq!(records[0].port, 1001);

        assert!(!records[1].local);
        assert_eq!(records[1].referrer, Some(node));
        assert_eq!(records[1].port, 1000);
        assert_eq!(records[1].topic, topic);
    }

    #[test]
    fn empty_reply_yields_nothing() {
        let topic = TopicKey::from_bytes([0u8; 32]);
        assert_eq!(DhtReply::default().into_records(topic).count(), 0);
    }
}
