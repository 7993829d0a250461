//! Topic keys and the LAN domain names derived from them.
//!
//! Domain names only keep the first 20 bytes of a key so the hex label
//! stays within DNS label limits. Keys sharing that prefix share a domain.

use std::fmt;

/// Default suffix for topic domain names.
pub const DEFAULT_DOMAIN_SUFFIX: &str = "hyperswarm.local";

const DOMAIN_PREFIX_LEN: usize = 20;

/// A 32-byte topic identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey([u8; 32]);

impl TopicKey {
    /// Wrap raw key bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a random key.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for TopicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for TopicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicKey({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Derive the LAN domain name for a topic key.
pub fn domain_for(key: &TopicKey, suffix: &str) -> String {
    format!("{}.{}", hex::encode(&key.0[..DOMAIN_PREFIX_LEN]), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_is_deterministic() {
        let key = TopicKey::from_bytes([7u8; 32]);
        assert_eq!(
            domain_for(&key, DEFAULT_DOMAIN_SUFFIX),
            domain_for(&key, DEFAULT_DOMAIN_SUFFIX)
        );
    }

    #[test]
    fn domain_uses_hex_prefix_and_suffix() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        bytes[19] = 0x01;
        let name = domain_for(&TopicKey::from_bytes(bytes), "example.local");
        assert_eq!(
            name,
            "ab00000000000000000000000000000000000001.example.local"
        );
    }

    #[test]
    fn domain_ignores_trailing_bytes() {
        let mut a = [3u8; 32];
        let mut b = [3u8; 32];
        a[31] = 1;
        b[20] = 9;
        assert_eq!(
            domain_for(&TopicKey::from_bytes(a), DEFAULT_DOMAIN_SUFFIX),
            domain_for(&TopicKey::from_bytes(b), DEFAULT_DOMAIN_SUFFIX)
        );
    }

    #[test]
    fn domain_changes_with_prefix() {
        let a = TopicKey::from_bytes([1u8; 32]);
        let mut b = [1u8; 32];
        b[19] = 2;
        assert_ne!(
            domain_for(&a, DEFAULT_DOMAIN_SUFFIX),
            domain_for(&TopicKey::from_bytes(b), DEFAULT_DOMAIN_SUFFIX)
        );
    }
}
