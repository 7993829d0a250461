//! LAN multicast collaborator contract.
//!
//! Packets are modelled as typed records rather than DNS wire format. A
//! topic is asked for with an SRV question on its domain name; announcers
//! answer with an SRV record for their port plus an identity record so
//! sessions can recognise (and skip) their own traffic.

pub mod memory;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;

use futures_util::Stream;

use crate::record::SessionId;
use crate::Result;

/// SRV target meaning "use the sender's address".
pub const ANY_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Record kinds used by topic discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// Service location: target host and port.
    Srv,
    /// Opaque session identity.
    Txt,
    /// Address a responder observed for the querier.
    Referrer,
}

/// A question in a query packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Record kind asked for.
    pub kind: RecordType,
    /// Domain name asked about.
    pub name: String,
}

/// Record payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// Announced service location.
    Srv {
        /// Host, or [`ANY_ADDR`] for the sender's own address.
        target: IpAddr,
        /// Announced port.
        port: u16,
    },
    /// Identity of the session that produced the packet.
    Identity(SessionId),
    /// Address observed for the session that asked.
    Referrer {
        /// Identity carried by the query being answered.
        querier: SessionId,
        /// Address the query arrived from.
        addr: SocketAddr,
    },
}

/// A named record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Domain name the record belongs to.
    pub name: String,
    /// Payload.
    pub data: RecordData,
}

impl Record {
    /// Record kind of the payload.
    pub fn kind(&self) -> RecordType {
        match self.data {
            RecordData::Srv { .. } => RecordType::Srv,
            RecordData::Identity(_) => RecordType::Txt,
            RecordData::Referrer { .. } => RecordType::Referrer,
        }
    }

    /// SRV record advertising `port` on the sender's address.
    pub fn srv(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            data: RecordData::Srv {
                target: ANY_ADDR,
                port,
            },
        }
    }

    /// Identity record.
    pub fn identity(name: impl Into<String>, id: SessionId) -> Self {
        Self {
            name: name.into(),
            data: RecordData::Identity(id),
        }
    }
}

/// A query or response packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Questions (queries only).
    pub questions: Vec<Question>,
    /// Answers, plus identity records on queries.
    pub answers: Vec<Record>,
}

impl Packet {
    /// SRV query for `name` carrying the asking session's identity.
    pub fn query(name: impl Into<String>, id: SessionId) -> Self {
        let name = name.into();
        Self {
            questions: vec![Question {
                kind: RecordType::Srv,
                name: name.clone(),
            }],
            answers: vec![Record::identity(name, id)],
        }
    }

    /// First identity record for `name`, if any.
    pub fn identity_for(&self, name: &str) -> Option<SessionId> {
        self.answers.iter().find_map(|a| match a.data {
            RecordData::Identity(id) if a.name == name => Some(id),
            _ => None,
        })
    }

    /// SRV answers paired with the identity record that follows each one.
    ///
    /// Responders emit `(srv, identity)` pairs per session, so several
    /// sessions behind one socket can answer in a single packet.
    pub fn srv_answers(&self) -> Vec<SrvAnswer<'_>> {
        let mut out = Vec::new();
        for (i, answer) in self.answers.iter().enumerate() {
            let RecordData::Srv { target, port } = answer.data else {
                continue;
            };
            let identity = self.answers[i + 1..]
                .iter()
                .filter(|a| a.name == answer.name)
                .take_while(|a| a.kind() != RecordType::Srv)
                .find_map(|a| match a.data {
                    RecordData::Identity(id) => Some(id),
                    _ => None,
                });
            out.push(SrvAnswer {
                name: &answer.name,
                target,
                port,
                identity,
            });
        }
        out
    }
}

/// An SRV answer with its responder identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrvAnswer<'a> {
    /// Domain name.
    pub name: &'a str,
    /// Advertised host, possibly [`ANY_ADDR`].
    pub target: IpAddr,
    /// Advertised port.
    pub port: u16,
    /// Identity of the responding session.
    pub identity: Option<SessionId>,
}

impl SrvAnswer<'_> {
    /// Resolve the advertised address against the sender's address.
    pub fn resolve(&self, from: SocketAddr) -> SocketAddr {
        let host = if self.target.is_unspecified() {
            from.ip()
        } else {
            self.target
        };
        SocketAddr::new(host, self.port)
    }
}

/// Packet received from the LAN.
#[derive(Debug, Clone)]
pub enum MulticastEvent {
    /// Someone asked a question.
    Query {
        /// The packet.
        packet: Packet,
        /// Sender address.
        from: SocketAddr,
    },
    /// Someone answered.
    Response {
        /// The packet.
        packet: Packet,
        /// Sender address.
        from: SocketAddr,
    },
}

/// Stream of inbound packets.
pub type MulticastEvents = Pin<Box<dyn Stream<Item = MulticastEvent> + Send>>;

/// A multicast socket shared by every topic of a registry.
pub trait MulticastSocket: Send + Sync + 'static {
    /// Broadcast a query.
    fn query(&self, packet: Packet) -> Result<()>;

    /// Broadcast a response.
    fn respond(&self, packet: Packet) -> Result<()>;

    /// Inbound packets. The stream ends once the socket is destroyed.
    fn events(&self) -> MulticastEvents;

    /// Release the socket.
    fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_carries_identity() {
        let id = SessionId::random();
        let packet = Packet::query("abc.hyperswarm.local", id);
        assert_eq!(packet.questions.len(), 1);
        assert_eq!(packet.questions[0].kind, RecordType::Srv);
        assert_eq!(packet.identity_for("abc.hyperswarm.local"), Some(id));
        assert_eq!(packet.identity_for("other.hyperswarm.local"), None);
    }

    #[test]
    fn srv_answers_pair_with_following_identity() {
        let a = SessionId::random();
        let b = SessionId::random();
        let packet = Packet {
            questions: vec![],
            answers: vec![
                Record::srv("t.local", 1001),
                Record::identity("t.local", a),
                Record::srv("t.local", 1002),
                Record::identity("t.local", b),
                Record::srv("u.local", 1003),
            ],
        };

        let answers = packet.srv_answers();
        assert_eq!(answers.len(), 3);
        assert_eq!((answers[0].port, answers[0].identity), (1001, Some(a)));
        assert_eq!((answers[1].port, answers[1].identity), (1002, Some(b)));
        assert_eq!((answers[2].port, answers[2].identity), (1003, None));
    }

    #[test]
    fn sentinel_target_resolves_to_sender() {
        let packet = Packet {
            questions: vec![],
            answers: vec![
                Record::srv("t.local", 1001),
                Record {
                    name: "t.local".into(),
                    data: RecordData::Srv {
                        target: "192.168.1.9".parse().unwrap(),
                        port: 1002,
                    },
                },
            ],
        };
        let from: SocketAddr = "192.168.1.4:5353".parse().unwrap();
        let answers = packet.srv_answers();
        assert_eq!(answers[0].resolve(from), "192.168.1.4:1001".parse::<SocketAddr>().unwrap());
        assert_eq!(answers[1].resolve(from), "192.168.1.9:1002".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn record_kinds() {
        assert_eq!(Record::srv("a", 1).kind(), RecordType::Srv);
        assert_eq!(
            Record::identity("a", SessionId::random()).kind(),
            RecordType::Txt
        );
    }
}
