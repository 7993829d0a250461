//! Error types for topic-discovery.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operation attempted on a destroyed registry or topic.
    #[error("Discovery instance is destroyed")]
    InvalidState,

    /// `ping` was called without any bootstrap nodes configured.
    #[error("No bootstrap nodes available")]
    NoBootstrapNodes,

    /// Every bootstrap node failed to answer a ping.
    #[error("All bootstrap nodes failed")]
    AllBootstrapNodesFailed,

    /// Fewer than two bootstrap nodes replied, so NAT consistency is unknown.
    #[error("Not enough bootstrap nodes replied")]
    NotEnoughReplies,

    /// Hole punching needs the DHT node that referred the peer.
    #[error("Referrer needed to holepunch")]
    ReferrerRequired,

    /// A single-peer lookup closed before any peer was found.
    #[error("Lookup failed")]
    LookupFailed,

    /// DHT collaborator error.
    #[error("DHT error: {0}")]
    Dht(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a DHT error.
    pub fn dht<S: Into<String>>(msg: S) -> Self {
        Self::Dht(msg.into())
    }
}
