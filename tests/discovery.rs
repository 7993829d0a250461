use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use topic_discovery::dht::memory::{MemoryDht, MemoryDhtNetwork};
use topic_discovery::multicast::memory::{MemoryLan, MemoryMulticast};
use topic_discovery::{
    AnnounceOptions, DestroyOptions, DhtOptions, Discovery, DiscoveryConfig, Error, LookupOptions,
    PeerRecord, Topic, TopicEvent, TopicKey,
};

const WAIT: Duration = Duration::from_secs(5);

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

struct Node {
    discovery: Discovery,
    dht: Arc<MemoryDht>,
    socket: Arc<MemoryMulticast>,
}

fn node(net: &Arc<MemoryDhtNetwork>, lan: &Arc<MemoryLan>, at: &str) -> Node {
    let dht = Arc::new(net.client(addr(at), DhtOptions::default()));
    let socket = Arc::new(lan.socket(addr(at)));
    let discovery = Discovery::new(dht.clone(), socket.clone(), DiscoveryConfig::default());
    Node {
        discovery,
        dht,
        socket,
    }
}

/// A network whose DHT nodes never answer, leaving the LAN as the only path.
fn lan_only() -> (Arc<MemoryDhtNetwork>, Arc<MemoryLan>) {
    let net = MemoryDhtNetwork::new();
    net.set_responders(0);
    (net, MemoryLan::new())
}

async fn next_peer(topic: &mut Topic) -> PeerRecord {
    timeout(WAIT, async {
        loop {
            match topic.recv().await {
                Some(TopicEvent::Peer(peer)) => return peer,
                Some(TopicEvent::Close) | None => panic!("topic closed before a peer was found"),
                Some(_) => {}
            }
        }
    })
    .await
    .expect("no peer within timeout")
}

async fn wait_for_update(topic: &mut Topic) {
    timeout(WAIT, async {
        loop {
            match topic.recv().await {
                Some(TopicEvent::Update(_)) => return,
                Some(TopicEvent::Close) | None => panic!("topic closed"),
                Some(_) => {}
            }
        }
    })
    .await
    .expect("no update within timeout")
}

/// Peers received within a short quiet window.
async fn drain_peers(topic: &mut Topic) -> Vec<PeerRecord> {
    let mut peers = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), topic.recv()).await {
        if let TopicEvent::Peer(peer) = event {
            peers.push(peer);
        }
    }
    peers
}

#[test_log::test(tokio::test)]
async fn lan_lookup_finds_announcer() {
    let (net, lan) = lan_only();
    let d1 = node(&net, &lan, "10.0.0.1:49737");
    let d2 = node(&net, &lan, "10.0.0.2:49737");
    let key = TopicKey::random();

    let _announced = d1.discovery.announce(key, AnnounceOptions::new(10000)).unwrap();
    let mut lookup = d2.discovery.lookup(key, LookupOptions::default()).unwrap();

    let peer = next_peer(&mut lookup).await;
    assert_eq!(peer.port, 10000);
    assert_eq!(peer.host, addr("10.0.0.1:0").ip());
    assert!(peer.local);
    assert_eq!(peer.referrer, None);
    assert_eq!(peer.topic, key);
}

#[test_log::test(tokio::test)]
async fn mutual_announcers_see_each_other_once() {
    let (net, lan) = lan_only();
    let key = TopicKey::random();

    let d1 = node(&net, &lan, "10.0.0.1:49737");
    let mut t1 = d1
        .discovery
        .announce(key, AnnounceOptions::new(1001).lookup(true))
        .unwrap();
    // D1's opening query goes out before D2 is on the LAN.
    wait_for_update(&mut t1).await;

    let d2 = node(&net, &lan, "10.0.0.2:49737");
    let mut t2 = d2
        .discovery
        .announce(key, AnnounceOptions::new(1002).lookup(true))
        .unwrap();

    let seen_by_2 = next_peer(&mut t2).await;
    assert_eq!(seen_by_2.addr(), addr("10.0.0.1:1001"));

    t1.update();
    let seen_by_1 = next_peer(&mut t1).await;
    assert_eq!(seen_by_1.addr(), addr("10.0.0.2:1002"));

    assert!(drain_peers(&mut t1).await.is_empty());
    assert!(drain_peers(&mut t2).await.is_empty());
}

#[test_log::test(tokio::test)]
async fn lookup_one_fails_when_closed_without_peers() {
    let net = MemoryDhtNetwork::new();
    let d = node(&net, &MemoryLan::new(), "10.0.0.1:49737");
    let key = TopicKey::random();

    let lookup = tokio::spawn({
        let discovery = d.discovery.clone();
        async move { discovery.lookup_one(key, LookupOptions::default()).await }
    });
    // Let the lookup register before tearing the registry down.
    tokio::task::yield_now().await;

    d.discovery.destroy(DestroyOptions::default()).await;
    let result = timeout(WAIT, lookup).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::LookupFailed)));
}

#[test_log::test(tokio::test)]
async fn lookup_one_returns_first_peer() {
    let (net, lan) = lan_only();
    let d1 = node(&net, &lan, "10.0.0.1:49737");
    let d2 = node(&net, &lan, "10.0.0.2:49737");
    let key = TopicKey::random();

    let _announced = d1.discovery.announce(key, AnnounceOptions::new(4000)).unwrap();
    let peer = timeout(WAIT, d2.discovery.lookup_one(key, LookupOptions::default()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(peer.addr(), addr("10.0.0.1:4000"));
}

#[test_log::test(tokio::test)]
async fn same_instance_announces_are_both_found() {
    let net = MemoryDhtNetwork::new();
    let d = node(&net, &MemoryLan::new(), "10.0.0.1:49737");
    let key = TopicKey::random();

    let _a = d.discovery.announce(key, AnnounceOptions::new(1001)).unwrap();
    let _b = d.discovery.announce(key, AnnounceOptions::new(1002)).unwrap();
    assert!(timeout(WAIT, d.discovery.flush()).await.unwrap());

    let mut lookup = d.discovery.lookup(key, LookupOptions::default()).unwrap();
    let mut ports = HashSet::new();
    while ports.len() < 2 {
        ports.insert(next_peer(&mut lookup).await.port);
    }
    assert_eq!(ports, HashSet::from([1001, 1002]));
}

#[test_log::test(tokio::test)]
async fn dht_peers_carry_their_referrer() {
    let net = MemoryDhtNetwork::new();
    let d1 = node(&net, &MemoryLan::new(), "1.1.1.1:49737");
    let d2 = node(&net, &MemoryLan::new(), "2.2.2.2:49737");
    let key = TopicKey::random();

    let announced = d1.discovery.announce(key, AnnounceOptions::new(7000)).unwrap();
    assert!(timeout(WAIT, announced.flush()).await.unwrap());

    let mut lookup = d2.discovery.lookup(key, LookupOptions::default()).unwrap();
    let peer = next_peer(&mut lookup).await;
    assert_eq!(peer.addr(), addr("1.1.1.1:7000"));
    assert!(!peer.local);
    assert_eq!(peer.referrer, Some(addr("2.2.2.2:49737")));
    assert_eq!(peer.to, Some(addr("2.2.2.2:49737")));
    d2.discovery.holepunch(&peer).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn graceful_destroy_unannounces_first() {
    let net = MemoryDhtNetwork::new();
    let d = node(&net, &MemoryLan::new(), "10.0.0.1:49737");
    let key = TopicKey::random();

    let mut topic = d.discovery.announce(key, AnnounceOptions::new(1001)).unwrap();
    assert!(timeout(WAIT, topic.flush()).await.unwrap());
    assert_eq!(net.announced(&key), vec![addr("10.0.0.1:1001")]);

    timeout(WAIT, d.discovery.destroy(DestroyOptions::default()))
        .await
        .unwrap();
    assert!(net.announced(&key).is_empty());
    assert!(d.dht.is_destroyed());
    assert!(d.socket.is_destroyed());

    let mut events = Vec::new();
    while let Some(event) = topic.recv().await {
        events.push(event);
    }
    assert!(matches!(events.last(), Some(TopicEvent::Close)));
}

#[test_log::test(tokio::test)]
async fn forced_destroy_leaves_announcements() {
    let net = MemoryDhtNetwork::new();
    let d = node(&net, &MemoryLan::new(), "10.0.0.1:49737");
    let key = TopicKey::random();

    let topic = d.discovery.announce(key, AnnounceOptions::new(1001)).unwrap();
    assert!(timeout(WAIT, topic.flush()).await.unwrap());

    timeout(WAIT, d.discovery.destroy(DestroyOptions { force: true }))
        .await
        .unwrap();
    timeout(WAIT, topic.closed()).await.unwrap();
    assert_eq!(net.announced(&key), vec![addr("10.0.0.1:1001")]);
    assert!(d.dht.is_destroyed());
}

#[test_log::test(tokio::test)]
async fn failed_round_reports_error_and_flushes_false() {
    let net = MemoryDhtNetwork::new();
    net.fail_streams(true);
    let d = node(&net, &MemoryLan::new(), "10.0.0.1:49737");
    let key = TopicKey::random();

    let mut topic = d.discovery.lookup(key, LookupOptions::default()).unwrap();
    assert!(!timeout(WAIT, d.discovery.flush()).await.unwrap());

    let err = timeout(WAIT, async {
        loop {
            if let Some(TopicEvent::Update(err)) = topic.recv().await {
                return err;
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(err.as_deref(), Some(Error::Dht(_))));
}
