//! Per-topic discovery session.
//!
//! Each topic runs as one task that owns two retry loops:
//!
//! - **DHT loop**: one announce or lookup stream per round, rounds spaced
//!   by a jittered delay of `[dht_interval, 2 * dht_interval)`.
//! - **Multicast loop**: one LAN query per tick, ticks spaced by a jittered
//!   delay of `[multicast_interval, 2 * multicast_interval)`.
//!
//! The [`Topic`] handle talks to the task over a command channel and
//! observes it through a broadcast channel of [`TopicEvent`]s.

use std::future::pending;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, Sleep};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace, warn};

use crate::config::{AnnounceOptions, DiscoveryConfig, LookupOptions, Stabilization};
use crate::dht::{AnnounceConfig, DhtClient, DhtReply, PeerStream};
use crate::domain::TopicKey;
use crate::multicast::{MulticastSocket, Packet};
use crate::record::{PeerRecord, SessionId};
use crate::{Error, Result};

const EVENT_BUFFER: usize = 256;

/// Event emitted by a topic session.
#[derive(Debug, Clone)]
pub enum TopicEvent {
    /// A peer was discovered.
    Peer(PeerRecord),
    /// A DHT round started.
    Updating,
    /// A DHT round ended, with its error if it failed.
    Update(Option<Arc<Error>>),
    /// The session is closed. Always the last event.
    Close,
}

pub(crate) enum Command {
    Update,
    Flush(oneshot::Sender<bool>),
    Deliver(PeerRecord),
    Destroy { unannounce: bool },
}

/// State shared between a [`Topic`] handle, the registry index, and the task.
pub(crate) struct TopicShared {
    pub(crate) key: TopicKey,
    pub(crate) id: SessionId,
    pub(crate) domain: String,
    /// Port answered to LAN queries, if the topic announces one.
    pub(crate) advertised_port: Option<u16>,
    announcing: bool,
    commands: mpsc::UnboundedSender<Command>,
    closed: watch::Receiver<bool>,
    destroyed: AtomicBool,
}

impl TopicShared {
    /// Request destruction. Returns false if it was already requested.
    pub(crate) fn destroy(&self, unannounce: bool) -> bool {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.commands.send(Command::Destroy { unannounce });
        true
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn deliver(&self, peer: PeerRecord) {
        let _ = self.commands.send(Command::Deliver(peer));
    }

    pub(crate) async fn flush(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Flush(tx)).is_err() {
            return true;
        }
        // A dropped sender means the session went away mid-flush.
        rx.await.unwrap_or(true)
    }

    pub(crate) async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
    }
}

/// Handle to a topic session created by [`Discovery`](crate::Discovery).
///
/// Dropping the handle does not stop the session; call [`Topic::destroy`].
pub struct Topic {
    shared: Arc<TopicShared>,
    events: broadcast::Receiver<TopicEvent>,
}

impl Topic {
    /// The topic key.
    pub fn key(&self) -> &TopicKey {
        &self.shared.key
    }

    /// The session identity used to filter out our own LAN traffic.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// The LAN domain name of the topic.
    pub fn domain(&self) -> &str {
        &self.shared.domain
    }

    /// Whether the session announces itself.
    pub fn is_announcing(&self) -> bool {
        self.shared.announcing
    }

    /// Whether [`destroy`](Topic::destroy) was called on this session.
    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Receive the next event.
    ///
    /// The handle's receiver exists from construction on, so no event is
    /// missed. Returns `None` once the session is gone and every buffered
    /// event has been read.
    pub async fn recv(&mut self) -> Option<TopicEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(domain = %self.shared.domain, skipped, "topic listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// An independent listener for events emitted from now on.
    pub fn subscribe(&self) -> impl Stream<Item = TopicEvent> + Send + 'static {
        BroadcastStream::new(self.events.resubscribe()).filter_map(|msg| async move { msg.ok() })
    }

    /// Restart the DHT round and the multicast loop immediately.
    pub fn update(&self) {
        if self.shared.is_destroyed() {
            return;
        }
        let _ = self.shared.commands.send(Command::Update);
    }

    /// Wait until the current DHT round is flushed.
    ///
    /// Returns whether the round ended without error. Resolves immediately
    /// with `true` if no round is in flight or the session is destroyed.
    pub async fn flush(&self) -> bool {
        self.shared.flush().await
    }

    /// Stop the session. Announcing sessions unannounce before closing.
    pub fn destroy(&self) {
        self.shared.destroy(true);
    }

    /// Wait until the session has closed.
    pub async fn closed(&self) {
        self.shared.closed().await
    }
}

/// Largest reply size seen so far and how often it was matched.
#[derive(Debug, Default, Clone, Copy)]
struct ReplyTracker {
    max: usize,
    repeats: usize,
}

impl ReplyTracker {
    fn observe(&mut self, len: usize, cap: usize) -> usize {
        if len < cap && len >= self.max {
            self.max = len;
            self.repeats += 1;
        }
        self.repeats
    }
}

/// Flush bookkeeping for one DHT round.
#[derive(Debug, Default)]
struct Round {
    local: ReplyTracker,
    remote: ReplyTracker,
    flushed: bool,
}

impl Round {
    /// Record one reply. Returns true once the round has stabilized.
    fn observe(&mut self, local: usize, remote: usize, limits: &Stabilization) -> bool {
        let local = self.local.observe(local, limits.saturation_cap);
        let remote = self.remote.observe(remote, limits.saturation_cap);
        local >= limits.repeat_threshold || remote >= limits.repeat_threshold
    }
}

/// Uniform delay in `[base, 2 * base)`.
pub(crate) fn jitter(base: Duration) -> Duration {
    base + base.mul_f64(rand::random::<f64>())
}

pub(crate) type Detach = Box<dyn FnOnce() + Send>;

/// Everything needed to start a topic session.
pub(crate) struct SessionParams {
    pub(crate) key: TopicKey,
    pub(crate) id: SessionId,
    pub(crate) domain: String,
    pub(crate) announce: Option<AnnounceOptions>,
    pub(crate) lookup: LookupOptions,
    pub(crate) config: DiscoveryConfig,
    pub(crate) dht: Arc<dyn DhtClient>,
    pub(crate) multicast: Arc<dyn MulticastSocket>,
    /// Removes the session from the registry index.
    pub(crate) detach: Detach,
}

/// The task side of a topic.
pub(crate) struct Session {
    key: TopicKey,
    id: SessionId,
    domain: String,
    announce: Option<AnnounceConfig>,
    lookup: LookupOptions,
    dht: Arc<dyn DhtClient>,
    multicast: Arc<dyn MulticastSocket>,
    detach: Option<Detach>,

    dht_interval: Duration,
    multicast_interval: Duration,
    stabilization: Stabilization,

    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<TopicEvent>,
    closed: watch::Sender<bool>,

    stream: Option<PeerStream>,
    dht_timer: Option<Pin<Box<Sleep>>>,
    round: Round,
    waiters: Vec<oneshot::Sender<bool>>,

    multicast_enabled: bool,
    multicast_timer: Option<Pin<Box<Sleep>>>,
}

impl Session {
    /// Build a session and its handle. The caller indexes the shared state
    /// and then spawns [`Session::run`].
    pub(crate) fn new(params: SessionParams) -> (Self, Topic) {
        let SessionParams {
            key,
            id,
            domain,
            announce,
            lookup,
            config,
            dht,
            multicast,
            detach,
        } = params;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = broadcast::channel(EVENT_BUFFER);
        let (closed_tx, closed_rx) = watch::channel(false);

        let multicast_enabled = announce.as_ref().map_or(true, |a| a.lookup);
        let shared = Arc::new(TopicShared {
            key,
            id,
            domain: domain.clone(),
            advertised_port: announce.as_ref().and_then(|a| a.advertised_port()),
            announcing: announce.is_some(),
            commands: command_tx,
            closed: closed_rx,
            destroyed: AtomicBool::new(false),
        });

        let session = Self {
            key,
            id,
            domain,
            announce: announce.map(|a| AnnounceConfig {
                port: a.port,
                local_address: a.local_address,
            }),
            lookup,
            dht,
            multicast,
            detach: Some(detach),
            dht_interval: config.dht_interval,
            multicast_interval: config.multicast_interval,
            stabilization: config.stabilization,
            commands: command_rx,
            events: event_tx,
            closed: closed_tx,
            stream: None,
            dht_timer: None,
            round: Round::default(),
            waiters: Vec::new(),
            multicast_enabled,
            multicast_timer: None,
        };

        let topic = Topic {
            shared,
            events: event_rx,
        };
        (session, topic)
    }

    pub(crate) fn shared(topic: &Topic) -> Arc<TopicShared> {
        Arc::clone(&topic.shared)
    }

    pub(crate) async fn run(mut self) {
        debug!(
            domain = %self.domain,
            announcing = self.announce.is_some(),
            multicast = self.multicast_enabled,
            "topic session started"
        );

        self.start_round();
        if self.multicast_enabled {
            self.multicast_tick();
        } else if self.announce.is_some() {
            // Let co-located lookups hear about us without waiting a tick.
            self.fire_query();
        }

        let unannounce = loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Update) => self.update(),
                    Some(Command::Flush(tx)) => self.flush(tx),
                    Some(Command::Deliver(peer)) => self.emit(TopicEvent::Peer(peer)),
                    Some(Command::Destroy { unannounce }) => break unannounce,
                    None => break true,
                },
                item = next_reply(&mut self.stream) => self.on_reply(item),
                _ = wait(&mut self.dht_timer) => self.start_round(),
                _ = wait(&mut self.multicast_timer) => self.multicast_tick(),
            }
        };

        self.shutdown(unannounce).await;
    }

    fn emit(&self, event: TopicEvent) {
        // No listeners is fine; the registry may hold the only reference.
        let _ = self.events.send(event);
    }

    fn start_round(&mut self) {
        self.dht_timer = None;
        self.round = Round::default();
        let stream = match &self.announce {
            Some(config) => self.dht.announce(&self.key, config),
            None => self.dht.lookup(&self.key, &self.lookup),
        };
        self.stream = Some(stream);
        trace!(domain = %self.domain, "dht round started");
        self.emit(TopicEvent::Updating);
    }

    fn on_reply(&mut self, item: Option<Result<DhtReply>>) {
        match item {
            Some(Ok(reply)) => {
                let (local, remote) = (reply.local_peers.len(), reply.peers.len());
                for peer in reply.into_records(self.key) {
                    self.emit(TopicEvent::Peer(peer));
                }
                if !self.round.flushed && self.round.observe(local, remote, &self.stabilization) {
                    debug!(domain = %self.domain, "dht round stabilized");
                    self.release(true);
                }
            }
            Some(Err(e)) => self.end_round(Some(e)),
            None => self.end_round(None),
        }
    }

    fn end_round(&mut self, err: Option<Error>) {
        self.stream = None;
        let ok = err.is_none();
        match &err {
            Some(e) => debug!(domain = %self.domain, error = %e, "dht round failed"),
            None => trace!(domain = %self.domain, "dht round complete"),
        }
        self.emit(TopicEvent::Update(err.map(Arc::new)));
        self.release(ok);

        let delay = jitter(self.dht_interval);
        trace!(domain = %self.domain, ?delay, "next dht round scheduled");
        self.dht_timer = Some(Box::pin(sleep(delay)));
    }

    /// Release flush waiters for the current round, once.
    fn release(&mut self, ok: bool) {
        if self.round.flushed {
            return;
        }
        self.round.flushed = true;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(ok);
        }
    }

    fn flush(&mut self, tx: oneshot::Sender<bool>) {
        if self.stream.is_none() || self.round.flushed {
            let _ = tx.send(true);
        } else {
            self.waiters.push(tx);
        }
    }

    fn update(&mut self) {
        if self.stream.take().is_some() {
            debug!(domain = %self.domain, "aborting in-flight dht round");
        }
        self.start_round();
        // Updating always (re)starts the LAN loop, announce-only topics included.
        self.multicast_enabled = true;
        self.multicast_tick();
    }

    fn multicast_tick(&mut self) {
        self.fire_query();
        let delay = jitter(self.multicast_interval);
        self.multicast_timer = Some(Box::pin(sleep(delay)));
    }

    fn fire_query(&self) {
        trace!(domain = %self.domain, "multicast query");
        if let Err(e) = self.multicast.query(Packet::query(&self.domain, self.id)) {
            warn!(domain = %self.domain, error = %e, "multicast query failed");
        }
    }

    async fn shutdown(mut self, unannounce: bool) {
        self.stream = None;
        self.dht_timer = None;
        self.multicast_timer = None;

        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            if let Command::Flush(tx) = cmd {
                self.waiters.push(tx);
            }
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(true);
        }

        if let Some(detach) = self.detach.take() {
            detach();
        }

        if let (true, Some(config)) = (unannounce, &self.announce) {
            if let Err(e) = self.dht.unannounce(&self.key, config).await {
                warn!(domain = %self.domain, error = %e, "unannounce failed");
            }
        }

        debug!(domain = %self.domain, "topic session closed");
        self.emit(TopicEvent::Close);
        self.closed.send_replace(true);
    }
}

async fn next_reply(stream: &mut Option<PeerStream>) -> Option<Result<DhtReply>> {
    match stream {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

async fn wait(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}
