//! Local block store and public key cache.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;
use tracing::debug;

use crate::common::{Block, ChkBlock, Id, Key, SskBlock};

/// Default capacity of each key type in [LruStore].
pub const MAX_BLOCKS: usize = 1000;
/// Default capacity of [PubKeyCache].
pub const MAX_PUBKEYS: usize = 1000;

/// Where verified blocks are committed.
pub trait BlockStore: std::fmt::Debug + Send + Sync {
    fn fetch(&self, key: &Key) -> Option<Block>;

    /// Commit a verified block.
    ///
    /// For SSK keys the first stored block wins, a different block under the same
    /// key is ignored.
    fn put(&self, block: Block);
}

#[derive(Debug)]
/// Default implementation of [BlockStore] trait, keeping the most recently used blocks.
pub struct LruStore {
    chk_blocks: Mutex<LruCache<Id, ChkBlock>>,
    ssk_blocks: Mutex<LruCache<Id, SskBlock>>,
}

impl Default for LruStore {
    fn default() -> Self {
        LruStore::new(MAX_BLOCKS)
    }
}

impl LruStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::new(MAX_BLOCKS).expect("MAX_BLOCKS is NonZeroUsize"));

        Self {
            chk_blocks: Mutex::new(LruCache::new(capacity)),
            ssk_blocks: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl BlockStore for LruStore {
    fn fetch(&self, key: &Key) -> Option<Block> {
        let routing_key = key.routing_key();

        match key {
            Key::Chk(_) => self
                .chk_blocks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&routing_key)
                .cloned()
                .map(Block::Chk),
            Key::Ssk(_) => self
                .ssk_blocks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&routing_key)
                .cloned()
                .map(Block::Ssk),
        }
    }

    fn put(&self, block: Block) {
        let routing_key = block.key().routing_key();

        match block {
            Block::Chk(block) => {
                self.chk_blocks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .put(routing_key, block);
            }
            Block::Ssk(block) => {
                let mut ssk_blocks = self
                    .ssk_blocks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);

                match ssk_blocks.peek(&routing_key) {
                    Some(existing) if existing != &block => {
                        debug!(key = %routing_key, "Keeping existing SSK block");
                    }
                    Some(_) => {}
                    None => {
                        ssk_blocks.put(routing_key, block);
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
/// Public keys seen for SSK subspaces, by public key hash.
pub struct PubKeyCache {
    keys: Mutex<LruCache<Id, [u8; 32]>>,
}

impl Default for PubKeyCache {
    fn default() -> Self {
        PubKeyCache::new(MAX_PUBKEYS)
    }
}

impl PubKeyCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::new(MAX_PUBKEYS).expect("MAX_PUBKEYS is NonZeroUsize"));

        Self {
            keys: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, pubkey_hash: &Id) -> Option<[u8; 32]> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pubkey_hash)
            .copied()
    }

    /// Cache a public key, returns false if it does not hash to `pubkey_hash`.
    pub fn put(&self, pubkey_hash: Id, pubkey: [u8; 32]) -> bool {
        if Id::hash(&[&pubkey[..]]) != pubkey_hash {
            return false;
        }

        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(pubkey_hash, pubkey);

        true
    }
}

#[cfg(test)]
mod test {
    use ed25519_dalek::SigningKey;

    use super::*;

    #[test]
    fn chk_round_trip() {
        let store = LruStore::new(2);
        let block = ChkBlock::new(&b"hd"[..], &b"data"[..]);

        store.put(block.clone().into());

        assert_eq!(
            store.fetch(&Key::Chk(*block.key())),
            Some(Block::Chk(block))
        );
    }

    #[test]
    fn ssk_first_writer_wins() {
        let store = LruStore::default();
        let signer = SigningKey::from_bytes(&[5; 32]);
        let first = SskBlock::new(&signer, b"doc", b"first");
        let second = SskBlock::new(&signer, b"doc", b"second");

        store.put(first.clone().into());
        store.put(second.into());

        assert_eq!(
            store.fetch(&Key::Ssk(*first.key())),
            Some(Block::Ssk(first))
        );
    }

    #[test]
    fn evicts_least_recently_used() {
        let store = LruStore::new(1);
        let a = ChkBlock::new(&b""[..], &b"a"[..]);
        let b = ChkBlock::new(&b""[..], &b"b"[..]);

        store.put(a.clone().into());
        store.put(b.into());

        assert_eq!(store.fetch(&Key::Chk(*a.key())), None);
    }

    #[test]
    fn pubkey_cache_checks_hash() {
        let cache = PubKeyCache::default();
        let pubkey = SigningKey::from_bytes(&[5; 32]).verifying_key().to_bytes();
        let hash = Id::hash(&[&pubkey[..]]);

        assert!(!cache.put(Id([0; 20]), pubkey));
        assert!(cache.put(hash, pubkey));
        assert_eq!(cache.get(&hash), Some(pubkey));
    }
}
