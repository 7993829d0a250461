//! Topic-based peer discovery over a DHT and LAN multicast.
//!
//! A [`Discovery`] registry shares one [`DhtClient`] and one
//! [`MulticastSocket`] between many topics. Each [`Topic`] announces and/or
//! looks up a 32-byte [`TopicKey`] on both, emitting [`TopicEvent`]s as
//! peers turn up.

#![deny(missing_docs)]

pub mod config;
pub mod dht;
pub mod domain;
pub mod error;
pub mod multicast;
pub mod record;
pub mod registry;
pub mod topic;

// Re-export key types
pub use config::{
    AnnounceOptions, DestroyOptions, DhtOptions, DiscoveryConfig, LookupOptions, Stabilization,
};
pub use dht::{AnnounceConfig, DhtClient, DhtReply, PeerStream};
pub use domain::{domain_for, TopicKey, DEFAULT_DOMAIN_SUFFIX};
pub use error::{Error, Result};
pub use multicast::{MulticastEvent, MulticastSocket, Packet};
pub use record::{PeerRecord, SessionId};
pub use registry::{Discovery, PingResult};
pub use topic::{Topic, TopicEvent};
