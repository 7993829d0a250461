//! In-process LAN: every socket hears every packet, its own included.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use super::{MulticastEvent, MulticastEvents, MulticastSocket, Packet};
use crate::Result;

/// A shared broadcast segment.
#[derive(Debug)]
pub struct MemoryLan {
    tx: broadcast::Sender<MulticastEvent>,
}

impl MemoryLan {
    /// Create an empty LAN.
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self { tx })
    }

    /// Attach a socket observed at `addr`.
    pub fn socket(self: &Arc<Self>, addr: SocketAddr) -> MemoryMulticast {
        let (closed, _) = watch::channel(false);
        MemoryMulticast {
            lan: Arc::clone(self),
            addr,
            closed,
        }
    }
}

/// A socket on a [`MemoryLan`].
#[derive(Debug)]
pub struct MemoryMulticast {
    lan: Arc<MemoryLan>,
    addr: SocketAddr,
    closed: watch::Sender<bool>,
}

impl MemoryMulticast {
    /// Whether [`MulticastSocket::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        *self.closed.borrow()
    }

    fn send(&self, event: MulticastEvent) -> Result<()> {
        if self.is_destroyed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket destroyed").into());
        }
        // No listeners is not an error on a broadcast medium.
        let _ = self.lan.tx.send(event);
        Ok(())
    }
}

impl MulticastSocket for MemoryMulticast {
    fn query(&self, packet: Packet) -> Result<()> {
        trace!(from = %self.addr, questions = packet.questions.len(), "lan query");
        self.send(MulticastEvent::Query {
            packet,
            from: self.addr,
        })
    }

    fn respond(&self, packet: Packet) -> Result<()> {
        trace!(from = %self.addr, answers = packet.answers.len(), "lan response");
        self.send(MulticastEvent::Response {
            packet,
            from: self.addr,
        })
    }

    fn events(&self) -> MulticastEvents {
        let mut closed = self.closed.subscribe();
        BroadcastStream::new(self.lan.tx.subscribe())
            .filter_map(|msg| async move { msg.ok() })
            .take_until(async move {
                loop {
                    if *closed.borrow_and_update() {
                        break;
                    }
                    if closed.changed().await.is_err() {
                        break;
                    }
                }
            })
            .boxed()
    }

    fn destroy(&self) {
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SessionId;

    #[tokio::test]
    async fn sockets_hear_each_other_and_themselves() {
        let lan = MemoryLan::new();
        let a = lan.socket("10.0.0.1:5353".parse().unwrap());
        let b = lan.socket("10.0.0.2:5353".parse().unwrap());
        let mut a_events = a.events();
        let mut b_events = b.events();

        a.query(Packet::query("x.local", SessionId::random())).unwrap();

        for events in [&mut a_events, &mut b_events] {
            match events.next().await {
                Some(MulticastEvent::Query { from, .. }) => {
                    assert_eq!(from, "10.0.0.1:5353".parse::<SocketAddr>().unwrap())
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn destroyed_socket_stops() {
        let lan = MemoryLan::new();
        let a = lan.socket("10.0.0.1:5353".parse().unwrap());
        let mut events = a.events();

        a.destroy();
        assert!(events.next().await.is_none());
        assert!(a.respond(Packet::default()).is_err());
    }
}
