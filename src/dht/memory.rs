//! In-process DHT for tests and local simulations.
//!
//! A [`MemoryDhtNetwork`] holds the shared announcement table. Each
//! [`MemoryDht`] is one client on that network, identified by the address
//! other nodes observe for it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tracing::trace;

use super::{AnnounceConfig, DhtClient, DhtReply, PeerStream};
use crate::config::{DhtOptions, LookupOptions};
use crate::domain::TopicKey;
use crate::record::PeerRecord;
use crate::{Error, Result};

const FIRST_NODE_PORT: u16 = 49737;

#[derive(Debug, Clone)]
struct Announcement {
    owner: SocketAddr,
    addr: SocketAddr,
    local_address: Option<SocketAddr>,
}

#[derive(Debug)]
struct NetworkState {
    announcements: HashMap<TopicKey, Vec<Announcement>>,
    bootstrap: Vec<SocketAddr>,
    responders: usize,
    fail_streams: bool,
    hold_streams: bool,
}

/// Shared state of an in-process DHT.
#[derive(Debug)]
pub struct MemoryDhtNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryDhtNetwork {
    /// Create an empty network with three responding nodes per query.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetworkState {
                announcements: HashMap::new(),
                bootstrap: Vec::new(),
                responders: 3,
                fail_streams: false,
                hold_streams: false,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a bootstrap node that answers pings.
    pub fn add_bootstrap(&self, addr: SocketAddr) {
        self.state().bootstrap.push(addr);
    }

    /// Number of nodes that reply to each announce or lookup.
    pub fn set_responders(&self, n: usize) {
        self.state().responders = n;
    }

    /// Make every new stream fail immediately.
    pub fn fail_streams(&self, fail: bool) {
        self.state().fail_streams = fail;
    }

    /// Keep new streams open after their replies instead of ending them.
    pub fn hold_streams(&self, hold: bool) {
        self.state().hold_streams = hold;
    }

    /// Addresses currently announced for `key`.
    pub fn announced(&self, key: &TopicKey) -> Vec<SocketAddr> {
        self.state()
            .announcements
            .get(key)
            .map(|list| list.iter().map(|a| a.addr).collect())
            .unwrap_or_default()
    }

    /// Create a client observed at `addr`.
    pub fn client(self: &Arc<Self>, addr: SocketAddr, options: DhtOptions) -> MemoryDht {
        MemoryDht {
            network: Arc::clone(self),
            addr,
            options,
            symmetric_nat: false,
            destroyed: AtomicBool::new(false),
        }
    }

    fn replies(&self, requester: SocketAddr, key: &TopicKey) -> PeerStream {
        let state = self.state();
        if state.fail_streams {
            return stream::iter(vec![Err(Error::dht("query failed"))]).boxed();
        }

        let mut peers = Vec::new();
        let mut local_peers = Vec::new();
        for ann in state.announcements.get(key).into_iter().flatten() {
            match ann.local_address {
                Some(local) if ann.owner.ip() == requester.ip() => local_peers.push(local),
                _ => peers.push(ann.addr),
            }
        }

        let replies: Vec<_> = (0..state.responders)
            .map(|i| {
                Ok(DhtReply {
                    node: Some(SocketAddr::new(
                        requester.ip(),
                        FIRST_NODE_PORT.wrapping_add(i as u16),
                    )),
                    peers: peers.clone(),
                    local_peers: local_peers.clone(),
                    to: Some(requester),
                })
            })
            .collect();
        trace!(replies = replies.len(), peers = peers.len(), "memory dht query");

        let replies = stream::iter(replies);
        if state.hold_streams {
            replies.chain(stream::pending()).boxed()
        } else {
            replies.boxed()
        }
    }
}

/// One client on a [`MemoryDhtNetwork`].
#[derive(Debug)]
pub struct MemoryDht {
    network: Arc<MemoryDhtNetwork>,
    addr: SocketAddr,
    options: DhtOptions,
    symmetric_nat: bool,
    destroyed: AtomicBool,
}

impl MemoryDht {
    /// Report a different port to every bootstrap node, as a symmetric NAT would.
    pub fn symmetric_nat(mut self, enabled: bool) -> Self {
        self.symmetric_nat = enabled;
        self
    }

    /// Whether [`DhtClient::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn announced_addr(&self, config: &AnnounceConfig) -> SocketAddr {
        let port = match config.port {
            0 => self.addr.port(),
            port => port,
        };
        SocketAddr::new(self.addr.ip(), port)
    }
}

#[async_trait]
impl DhtClient for MemoryDht {
    fn announce(&self, key: &TopicKey, config: &AnnounceConfig) -> PeerStream {
        let addr = self.announced_addr(config);
        {
            let mut state = self.network.state();
            let list = state.announcements.entry(*key).or_default();
            if !list.iter().any(|a| a.owner == self.addr && a.addr == addr) {
                list.push(Announcement {
                    owner: self.addr,
                    addr,
                    local_address: config.local_address,
                });
            }
        }
        self.network.replies(self.addr, key)
    }

    fn lookup(&self, key: &TopicKey, _options: &LookupOptions) -> PeerStream {
        self.network.replies(self.addr, key)
    }

    async fn unannounce(&self, key: &TopicKey, config: &AnnounceConfig) -> Result<()> {
        let addr = self.announced_addr(config);
        let mut state = self.network.state();
        if let Some(list) = state.announcements.get_mut(key) {
            list.retain(|a| !(a.owner == self.addr && a.addr == addr));
            if list.is_empty() {
                state.announcements.remove(key);
            }
        }
        Ok(())
    }

    async fn ping(&self, node: SocketAddr) -> Result<SocketAddr> {
        let state = self.network.state();
        let index = state
            .bootstrap
            .iter()
            .position(|b| *b == node)
            .ok_or_else(|| Error::dht(format!("ping to {node} timed out")))?;
        let port = if self.symmetric_nat {
            self.addr.port().wrapping_add(index as u16 + 1)
        } else {
            self.addr.port()
        };
        Ok(SocketAddr::new(self.addr.ip(), port))
    }

    async fn holepunch(&self, peer: &PeerRecord) -> Result<()> {
        match peer.referrer {
            Some(_) => Ok(()),
            None => Err(Error::ReferrerRequired),
        }
    }

    fn bootstrap_nodes(&self) -> Vec<SocketAddr> {
        self.options.bootstrap.clone()
    }

    fn ephemeral(&self) -> bool {
        self.options.ephemeral
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}
