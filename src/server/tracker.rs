//! Exclusive UID locks for running chains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::error;

use crate::common::Uid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Kind of chain holding a UID.
pub enum UidKind {
    ChkRequest,
    SskRequest,
    ChkInsert,
    SskInsert,
}

/// Loop prevention and load accounting for chains.
pub trait UidRegistry: std::fmt::Debug + Send + Sync {
    /// Lock `uid`, returns `false` if it is already locked.
    fn lock(&self, uid: Uid, kind: UidKind) -> bool;

    fn unlock(&self, uid: Uid, kind: UidKind);

    /// Number of locked UIDs.
    fn running(&self) -> usize;
}

#[derive(Debug, Default)]
/// Default implementation of [UidRegistry] trait.
pub struct UidTracker {
    locked: Mutex<HashMap<Uid, UidKind>>,
}

impl UidTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, uid: Uid) -> bool {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&uid)
    }

    /// Number of locked UIDs of one kind.
    pub fn running_of(&self, kind: UidKind) -> usize {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|locked| **locked == kind)
            .count()
    }
}

impl UidRegistry for UidTracker {
    fn lock(&self, uid: Uid, kind: UidKind) -> bool {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);

        if locked.contains_key(&uid) {
            return false;
        }
        locked.insert(uid, kind);

        true
    }

    fn unlock(&self, uid: Uid, kind: UidKind) {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);

        let held = locked.get(&uid).copied();
        if held == Some(kind) {
            locked.remove(&uid);
        } else {
            error!(%uid, ?kind, ?held, "Unlocking a UID that is not held");
        }
    }

    fn running(&self) -> usize {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Debug)]
/// A held UID, unlocked exactly once when dropped.
pub struct UidLock {
    registry: Arc<dyn UidRegistry>,
    uid: Uid,
    kind: UidKind,
}

impl UidLock {
    pub fn acquire(registry: &Arc<dyn UidRegistry>, uid: Uid, kind: UidKind) -> Option<UidLock> {
        if !registry.lock(uid, kind) {
            return None;
        }

        Some(UidLock {
            registry: registry.clone(),
            uid,
            kind,
        })
    }

    /// Lock a fresh random UID.
    pub fn random(registry: &Arc<dyn UidRegistry>, kind: UidKind) -> UidLock {
        loop {
            if let Some(lock) = UidLock::acquire(registry, Uid::random(), kind) {
                return lock;
            }
        }
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }
}

impl Drop for UidLock {
    fn drop(&mut self) {
        self.registry.unlock(self.uid, self.kind);
    }
}
