//! Routing keys for content-hash (CHK) and signed subspace (SSK) blocks.

use sha1_smol::Sha1;
use std::fmt::{self, Display, Formatter};

use super::{Id, Location};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Content hash key: the hash of a block's headers and data.
pub struct ChkKey(pub Id);

impl ChkKey {
    pub fn routing_key(&self) -> Id {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Signed subspace key: a public key hash and a document hash.
pub struct SskKey {
    pub pubkey_hash: Id,
    pub doc_hash: Id,
}

impl SskKey {
    /// Key of the document `doc_name` in the subspace of `public_key`.
    pub fn new(public_key: &[u8; 32], doc_name: &[u8]) -> Self {
        Self {
            pubkey_hash: Id::hash(&[&public_key[..]]),
            doc_hash: Id::hash(&[doc_name]),
        }
    }

    /// The hash that places this key on the ring.
    pub fn routing_key(&self) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(&self.doc_hash.0);
        hasher.update(&self.pubkey_hash.0);

        Id(hasher.digest().bytes())
    }

    /// Whether `public_key` is the key this subspace was derived from.
    pub fn matches_pubkey(&self, public_key: &[u8; 32]) -> bool {
        Id::hash(&[&public_key[..]]) == self.pubkey_hash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Chk(ChkKey),
    Ssk(SskKey),
}

impl Key {
    pub fn routing_key(&self) -> Id {
        match self {
            Key::Chk(key) => key.routing_key(),
            Key::Ssk(key) => key.routing_key(),
        }
    }

    /// Target point of this key on the keyspace ring.
    pub fn location(&self) -> Location {
        self.routing_key().location()
    }

    pub fn is_ssk(&self) -> bool {
        matches!(self, Key::Ssk(_))
    }
}

impl From<ChkKey> for Key {
    fn from(key: ChkKey) -> Self {
        Key::Chk(key)
    }
}

impl From<SskKey> for Key {
    fn from(key: SskKey) -> Self {
        Key::Ssk(key)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Key::Chk(key) => write!(f, "CHK@{}", key.0),
            Key::Ssk(key) => write!(f, "SSK@{}", key.routing_key()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ssk_routing_key_depends_on_both_hashes() {
        let a = SskKey::new(&[1; 32], b"index");
        let b = SskKey::new(&[1; 32], b"other");
        let c = SskKey::new(&[2; 32], b"index");

        assert_ne!(a.routing_key(), b.routing_key());
        assert_ne!(a.routing_key(), c.routing_key());
        assert!(a.matches_pubkey(&[1; 32]));
        assert!(!a.matches_pubkey(&[2; 32]));
    }
}
