//! Discovery registry for unified DHT + LAN multicast discovery.
//!
//! Owns the shared DHT client and multicast socket, indexes live topics by
//! domain name, and answers LAN queries on behalf of announcing topics.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{AnnounceOptions, DestroyOptions, DiscoveryConfig, LookupOptions};
use crate::dht::DhtClient;
use crate::domain::{domain_for, TopicKey};
use crate::multicast::{MulticastEvent, MulticastSocket, Packet, Record, RecordData, RecordType};
use crate::record::{PeerRecord, SessionId};
use crate::topic::{Session, SessionParams, Topic, TopicEvent, TopicShared};
use crate::{Error, Result};

/// One bootstrap node that answered a ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResult {
    /// The bootstrap node.
    pub bootstrap: SocketAddr,
    /// Round-trip time.
    pub rtt: Duration,
    /// Our address as seen by the bootstrap node.
    pub pong: SocketAddr,
}

type DomainIndex = HashMap<String, Vec<Arc<TopicShared>>>;

struct Inner {
    dht: Arc<dyn DhtClient>,
    multicast: Arc<dyn MulticastSocket>,
    config: DiscoveryConfig,
    domains: Mutex<DomainIndex>,
    observed: Mutex<Option<SocketAddr>>,
    destroyed: AtomicBool,
    closed: watch::Sender<bool>,
}

/// Topic discovery over a DHT and LAN multicast.
///
/// Cheap to clone; clones share the same DHT client, socket, and topics.
///
/// ```ignore
/// let discovery = Discovery::new(dht, multicast, DiscoveryConfig::default());
///
/// let announced = discovery.announce(key, AnnounceOptions::new(10000))?;
/// let mut lookup = discovery.lookup(key, LookupOptions::default())?;
/// while let Some(event) = lookup.recv().await {
///     if let TopicEvent::Peer(peer) = event {
///         println!("found {}", peer.addr());
///     }
/// }
/// ```
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<Inner>,
}

impl Discovery {
    /// Create a registry over a DHT client and a multicast socket.
    ///
    /// Must be called within a tokio runtime: the registry spawns a task
    /// that routes inbound multicast packets to topics.
    pub fn new(
        dht: Arc<dyn DhtClient>,
        multicast: Arc<dyn MulticastSocket>,
        config: DiscoveryConfig,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        let mut events = multicast.events();
        let inner = Arc::new(Inner {
            dht,
            multicast,
            config,
            domains: Mutex::new(HashMap::new()),
            observed: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            closed,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    MulticastEvent::Query { packet, from } => inner.on_query(&packet, from),
                    MulticastEvent::Response { packet, from } => inner.on_response(&packet, from),
                }
            }
            trace!("multicast dispatcher stopped");
        });

        Self { inner }
    }

    /// Announce ourselves for `key`, optionally also looking up peers.
    pub fn announce(&self, key: TopicKey, opts: AnnounceOptions) -> Result<Topic> {
        self.topic(key, Some(opts), LookupOptions::default())
    }

    /// Look up peers for `key`.
    pub fn lookup(&self, key: TopicKey, opts: LookupOptions) -> Result<Topic> {
        self.topic(key, None, opts)
    }

    /// Find a single peer for `key`, then stop looking.
    ///
    /// Fails with [`Error::LookupFailed`] if the lookup closes first.
    pub async fn lookup_one(&self, key: TopicKey, opts: LookupOptions) -> Result<PeerRecord> {
        let mut topic = self.lookup(key, opts)?;
        while let Some(event) = topic.recv().await {
            match event {
                TopicEvent::Peer(peer) => {
                    topic.destroy();
                    return Ok(peer);
                }
                TopicEvent::Close => break,
                TopicEvent::Updating | TopicEvent::Update(_) => {}
            }
        }
        Err(Error::LookupFailed)
    }

    /// Ping every bootstrap node concurrently.
    ///
    /// Nodes that fail to answer are left out of the result.
    pub async fn ping(&self) -> Result<Vec<PingResult>> {
        let nodes = self.inner.dht.bootstrap_nodes();
        if nodes.is_empty() {
            return Err(Error::NoBootstrapNodes);
        }

        let start = Instant::now();
        let dht = &self.inner.dht;
        let results = join_all(nodes.into_iter().map(|bootstrap| async move {
            match dht.ping(bootstrap).await {
                Ok(pong) => Some(PingResult {
                    bootstrap,
                    rtt: start.elapsed(),
                    pong,
                }),
                Err(e) => {
                    debug!(%bootstrap, error = %e, "bootstrap ping failed");
                    None
                }
            }
        }))
        .await;

        let replies: Vec<_> = results.into_iter().flatten().collect();
        if replies.is_empty() {
            return Err(Error::AllBootstrapNodesFailed);
        }
        Ok(replies)
    }

    /// Whether every bootstrap node sees the same external address for us.
    ///
    /// A consistent mapping means hole punching is likely to work.
    pub async fn holepunchable(&self) -> Result<bool> {
        let replies = self.ping().await?;
        if replies.len() < 2 {
            return Err(Error::NotEnoughReplies);
        }
        let first = replies[0].pong;
        Ok(replies.iter().all(|r| r.pong == first))
    }

    /// Punch a hole to a DHT-discovered peer through its referrer.
    pub async fn holepunch(&self, peer: &PeerRecord) -> Result<()> {
        if peer.referrer.is_none() {
            return Err(Error::ReferrerRequired);
        }
        self.inner.dht.holepunch(peer).await
    }

    /// Flush every live topic. Returns whether all rounds succeeded.
    pub async fn flush(&self) -> bool {
        let topics: Vec<_> = self
            .inner
            .topics()
            .into_iter()
            .filter(|t| !t.is_destroyed())
            .collect();
        join_all(topics.iter().map(|t| t.flush()))
            .await
            .into_iter()
            .all(|ok| ok)
    }

    /// Stop the multicast socket, destroy every topic, then the DHT client.
    ///
    /// Unless `opts.force` is set, waits for every topic to close (and so
    /// for announcing topics to unannounce) before releasing the DHT.
    /// Calling this again just waits for the first call to finish.
    pub async fn destroy(&self, opts: DestroyOptions) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            self.closed().await;
            return;
        }

        self.inner.multicast.destroy();

        let inner = Arc::clone(&self.inner);
        // Run teardown in its own task so a dropped caller cannot leave
        // the registry half closed.
        tokio::spawn(async move {
            debug!(force = opts.force, "destroying discovery");

            let topics = inner.topics();
            for topic in &topics {
                topic.destroy(!opts.force);
            }
            if !opts.force {
                join_all(topics.iter().map(|t| t.closed())).await;
            }

            inner.dht.destroy().await;
            debug!("discovery closed");
            inner.closed.send_replace(true);
        });

        self.closed().await;
    }

    /// Wait until [`destroy`](Discovery::destroy) has finished.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
    }

    /// Whether [`destroy`](Discovery::destroy) was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Whether the DHT client runs in ephemeral mode.
    pub fn ephemeral(&self) -> bool {
        self.inner.dht.ephemeral()
    }

    /// LAN domain name for `key`.
    pub fn domain(&self, key: &TopicKey) -> String {
        domain_for(key, &self.inner.config.domain_suffix)
    }

    /// Our address as reported by a LAN responder, if one told us.
    pub fn observed_address(&self) -> Option<SocketAddr> {
        *lock(&self.inner.observed)
    }

    /// Access the underlying DHT client.
    pub fn dht(&self) -> &Arc<dyn DhtClient> {
        &self.inner.dht
    }

    fn topic(
        &self,
        key: TopicKey,
        announce: Option<AnnounceOptions>,
        lookup: LookupOptions,
    ) -> Result<Topic> {
        self.inner.ensure_live()?;

        let id = SessionId::random();
        let domain = self.domain(&key);
        let detach = {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let domain = domain.clone();
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.detach(&domain, id);
                }
            })
        };

        let (session, topic) = Session::new(SessionParams {
            key,
            id,
            domain: domain.clone(),
            announce,
            lookup,
            config: self.inner.config.clone(),
            dht: Arc::clone(&self.inner.dht),
            multicast: Arc::clone(&self.inner.multicast),
            detach,
        });

        {
            // Re-checked under the lock so a concurrent destroy either
            // snapshots this topic or rejects it.
            let mut domains = lock(&self.inner.domains);
            self.inner.ensure_live()?;
            domains
                .entry(domain.clone())
                .or_default()
                .push(Session::shared(&topic));
        }
        debug!(%domain, announcing = topic.is_announcing(), "topic created");

        tokio::spawn(session.run());
        Ok(topic)
    }
}

impl Inner {
    fn ensure_live(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    fn topics(&self) -> Vec<Arc<TopicShared>> {
        lock(&self.domains).values().flatten().cloned().collect()
    }

    fn detach(&self, domain: &str, id: SessionId) {
        let mut domains = lock(&self.domains);
        if let Some(topics) = domains.get_mut(domain) {
            topics.retain(|t| t.id != id);
            if topics.is_empty() {
                domains.remove(domain);
            }
        }
        trace!(%domain, "topic detached");
    }

    /// Answer a LAN query for every announcing topic other than the asker.
    fn on_query(&self, packet: &Packet, from: SocketAddr) {
        let mut answers = Vec::new();
        {
            let domains = lock(&self.domains);
            for question in &packet.questions {
                if question.kind != RecordType::Srv {
                    continue;
                }
                let Some(topics) = domains.get(&question.name) else {
                    continue;
                };

                let querier = packet.identity_for(&question.name);
                let before = answers.len();
                for topic in topics.iter().filter(|t| !t.is_destroyed()) {
                    if querier == Some(topic.id) {
                        trace!(domain = %question.name, "skipping our own query");
                        continue;
                    }
                    if let Some(port) = topic.advertised_port {
                        answers.push(Record::srv(&question.name, port));
                        answers.push(Record::identity(&question.name, topic.id));
                    }
                }

                if answers.len() > before && self.config.multicast_referrer {
                    if let Some(querier) = querier {
                        answers.push(Record {
                            name: question.name.clone(),
                            data: RecordData::Referrer { querier, addr: from },
                        });
                    }
                }
            }
        }

        if answers.is_empty() {
            return;
        }
        trace!(%from, answers = answers.len(), "answering multicast query");
        let response = Packet {
            questions: Vec::new(),
            answers,
        };
        if let Err(e) = self.multicast.respond(response) {
            warn!(error = %e, "multicast response failed");
        }
    }

    /// Turn LAN answers into peers for every topic other than the responder.
    fn on_response(&self, packet: &Packet, from: SocketAddr) {
        let domains = lock(&self.domains);

        for answer in packet.srv_answers() {
            let Some(topics) = domains.get(answer.name) else {
                continue;
            };
            let addr = answer.resolve(from);
            for topic in topics.iter().filter(|t| !t.is_destroyed()) {
                if answer.identity == Some(topic.id) {
                    trace!(domain = %answer.name, "skipping our own answer");
                    continue;
                }
                topic.deliver(PeerRecord::multicast(addr, topic.key));
            }
        }

        for record in &packet.answers {
            let RecordData::Referrer { querier, addr } = record.data else {
                continue;
            };
            let ours = domains
                .get(&record.name)
                .is_some_and(|topics| topics.iter().any(|t| t.id == querier));
            if ours {
                debug!(%addr, "learned observed address from multicast referrer");
                *lock(&self.observed) = Some(addr);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
