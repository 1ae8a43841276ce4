//! Recently failed keys.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

use crate::common::{Block, Htl, Id, Key, PeerHandle, PeerId};

/// Default number of keys remembered by [RecentFailures].
pub const MAX_FAILED_KEYS: usize = 2000;
/// Peers remembered per failed key.
const MAX_FAILED_PEERS: usize = 20;

/// Consulted before routing a request, informed of every outcome.
pub trait FailureTable: std::fmt::Debug + Send + Sync {
    /// Whether a request for `key` at `htl` should be failed without routing.
    fn should_fail(&self, key: &Key, htl: Htl, requestor: Option<PeerId>) -> bool;

    /// `peer` could not find `key` at `htl`.
    fn on_failed(&self, key: &Key, peer: &PeerHandle, htl: Htl, timeout: Duration);

    /// A whole chain for `key` failed, on behalf of `requestor` if any.
    fn on_final_failure(
        &self,
        key: &Key,
        requestor: Option<&PeerHandle>,
        htl: Htl,
        timeout: Duration,
    );

    fn on_found(&self, block: &Block);
}

#[derive(Debug)]
struct FailedPeer {
    peer: PeerId,
    boot_id: u64,
    until: Instant,
}

#[derive(Debug)]
struct FailureEntry {
    /// Highest HTL a chain failed at while this entry is active.
    htl: Htl,
    until: Option<Instant>,
    failed_peers: Vec<FailedPeer>,
    requestors: Vec<PeerId>,
}

impl FailureEntry {
    fn new() -> Self {
        Self {
            htl: 0,
            until: None,
            failed_peers: Vec::new(),
            requestors: Vec::new(),
        }
    }

    fn is_active(&self, now: Instant) -> bool {
        self.until.is_some_and(|until| until > now)
    }
}

#[derive(Debug)]
/// Default implementation of [FailureTable] trait.
///
/// Peers are remembered by id and boot id, so a peer that reconnected is not
/// considered to have failed before.
pub struct RecentFailures {
    entries: Mutex<LruCache<Id, FailureEntry>>,
}

impl Default for RecentFailures {
    fn default() -> Self {
        RecentFailures::new(MAX_FAILED_KEYS)
    }
}

impl RecentFailures {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::new(MAX_FAILED_KEYS).expect("MAX_FAILED_KEYS is NonZeroUsize"));

        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Whether `peer`, in its current session, recently failed to find `key`.
    pub fn has_failed(&self, key: &Key, peer: &PeerHandle) -> bool {
        let now = Instant::now();

        self.lock()
            .peek(&key.routing_key())
            .map(|entry| {
                entry.failed_peers.iter().any(|failed| {
                    failed.peer == peer.id && failed.boot_id == peer.boot_id && failed.until > now
                })
            })
            .unwrap_or(false)
    }

    /// Peers that asked for `key` while it was failing.
    pub fn requestors(&self, key: &Key) -> Vec<PeerId> {
        self.lock()
            .peek(&key.routing_key())
            .map(|entry| entry.requestors.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<Id, FailureEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FailureTable for RecentFailures {
    fn should_fail(&self, key: &Key, htl: Htl, requestor: Option<PeerId>) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();

        let Some(entry) = entries.get_mut(&key.routing_key()) else {
            return false;
        };
        if !entry.is_active(now) || entry.htl < htl {
            return false;
        }

        if let Some(requestor) = requestor {
            if !entry.requestors.contains(&requestor) {
                entry.requestors.push(requestor);
            }
        }
        trace!(%key, htl, "Recently failed");

        true
    }

    fn on_failed(&self, key: &Key, peer: &PeerHandle, htl: Htl, timeout: Duration) {
        let until = Instant::now() + timeout;
        let mut entries = self.lock();
        let entry = entries.get_or_insert_mut(key.routing_key(), FailureEntry::new);

        entry.failed_peers.retain(|failed| failed.peer != peer.id);
        if entry.failed_peers.len() >= MAX_FAILED_PEERS {
            entry.failed_peers.remove(0);
        }
        entry.failed_peers.push(FailedPeer {
            peer: peer.id,
            boot_id: peer.boot_id,
            until,
        });
        trace!(%key, peer = %peer.id, htl, "Peer failed key");
    }

    fn on_final_failure(
        &self,
        key: &Key,
        requestor: Option<&PeerHandle>,
        htl: Htl,
        timeout: Duration,
    ) {
        let now = Instant::now();
        let mut entries = self.lock();
        let entry = entries.get_or_insert_mut(key.routing_key(), FailureEntry::new);

        entry.htl = if entry.is_active(now) {
            entry.htl.max(htl)
        } else {
            htl
        };
        entry.until = Some(now + timeout);

        if let Some(requestor) = requestor {
            if !entry.requestors.contains(&requestor.id) {
                entry.requestors.push(requestor.id);
            }
        }
    }

    fn on_found(&self, block: &Block) {
        self.lock().pop(&block.key().routing_key());
    }
}
