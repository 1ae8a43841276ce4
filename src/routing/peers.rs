//! Greedy next-hop selection over the connected peers.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::{HtlCoins, Location, PeerHandle, PeerId};

/// First backoff after an overload or fatal timeout.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Longest backoff a peer can accumulate.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);

/// Picks the next hop of a chain and keeps per-peer routing statistics.
pub trait PeerSelector: std::fmt::Debug + Send + Sync {
    /// The connected peer closest to `target` that is not in `exclude`.
    ///
    /// Backed off peers are skipped unless `allow_backoff_override` is set; ties are
    /// broken by lower remaining backoff.
    fn select_next_hop(
        &self,
        exclude: &HashSet<PeerId>,
        target: Location,
        allow_backoff_override: bool,
    ) -> Option<PeerHandle>;

    /// Current handle of a connected peer.
    fn handle(&self, peer: PeerId) -> Option<PeerHandle>;

    /// Whether the session `peer` was obtained from is still up.
    fn is_connected(&self, peer: &PeerHandle) -> bool;

    /// The peer answered within its timeouts.
    fn on_success(&self, peer: PeerId);

    /// The peer was overloaded or timed out, back it off.
    fn on_local_overload(&self, peer: PeerId);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub successes: u64,
    pub overloads: u64,
}

#[derive(Debug, Clone)]
struct PeerSlot {
    location: Location,
    boot_id: u64,
    connected: bool,
    coins: HtlCoins,
    backoff_until: Option<Instant>,
    backoff_length: Duration,
    stats: PeerStats,
}

impl PeerSlot {
    fn handle(&self, id: PeerId) -> PeerHandle {
        PeerHandle::new(id, self.location, self.boot_id, self.coins)
    }

    fn remaining_backoff(&self, now: Instant) -> Duration {
        self.backoff_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
/// Default implementation of [PeerSelector] trait.
///
/// Peers live in an arena indexed by [PeerId], slots are never reused.
pub struct PeerTable {
    slots: RwLock<Vec<PeerSlot>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn stats(&self, peer: PeerId) -> Option<PeerStats> {
        self.read().get(peer.0 as usize).map(|slot| slot.stats)
    }

    pub fn is_backed_off(&self, peer: PeerId) -> bool {
        let now = Instant::now();

        self.read()
            .get(peer.0 as usize)
            .is_some_and(|slot| slot.remaining_backoff(now) > Duration::ZERO)
    }

    // === Public Methods ===

    /// Register a connected peer, rolling its boundary HTL coins.
    pub fn add(&self, location: Location) -> PeerId {
        self.add_with_coins(location, HtlCoins::random())
    }

    /// Register a connected peer with explicit boundary HTL coins.
    pub fn add_with_coins(&self, location: Location, coins: HtlCoins) -> PeerId {
        let mut slots = self.write();
        let id = PeerId(slots.len() as u32);

        slots.push(PeerSlot {
            location,
            boot_id: 0,
            connected: true,
            coins,
            backoff_until: None,
            backoff_length: INITIAL_BACKOFF,
            stats: PeerStats::default(),
        });

        id
    }

    pub fn disconnect(&self, peer: PeerId) {
        if let Some(slot) = self.write().get_mut(peer.0 as usize) {
            slot.connected = false;
        }
    }

    /// Mark a peer connected again under a new boot id, returns the new handle.
    ///
    /// The boundary coins belong to the relationship and are kept.
    pub fn reconnect(&self, peer: PeerId) -> Option<PeerHandle> {
        let mut slots = self.write();
        let slot = slots.get_mut(peer.0 as usize)?;

        slot.connected = true;
        slot.boot_id += 1;

        Some(slot.handle(peer))
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<PeerSlot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<PeerSlot>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PeerSelector for PeerTable {
    fn select_next_hop(
        &self,
        exclude: &HashSet<PeerId>,
        target: Location,
        allow_backoff_override: bool,
    ) -> Option<PeerHandle> {
        let now = Instant::now();

        self.read()
            .iter()
            .enumerate()
            .map(|(index, slot)| (PeerId(index as u32), slot))
            .filter(|(id, slot)| slot.connected && !exclude.contains(id))
            .filter(|(_, slot)| {
                allow_backoff_override || slot.remaining_backoff(now) == Duration::ZERO
            })
            .min_by(|(_, a), (_, b)| {
                a.location
                    .distance(target)
                    .total_cmp(&b.location.distance(target))
                    .then_with(|| a.remaining_backoff(now).cmp(&b.remaining_backoff(now)))
            })
            .map(|(id, slot)| slot.handle(id))
    }

    fn handle(&self, peer: PeerId) -> Option<PeerHandle> {
        self.read()
            .get(peer.0 as usize)
            .filter(|slot| slot.connected)
            .map(|slot| slot.handle(peer))
    }

    fn is_connected(&self, peer: &PeerHandle) -> bool {
        self.read()
            .get(peer.id.0 as usize)
            .is_some_and(|slot| slot.connected && slot.boot_id == peer.boot_id)
    }

    fn on_success(&self, peer: PeerId) {
        if let Some(slot) = self.write().get_mut(peer.0 as usize) {
            slot.stats.successes += 1;
            slot.backoff_length = INITIAL_BACKOFF;
        }
    }

    fn on_local_overload(&self, peer: PeerId) {
        let now = Instant::now();

        if let Some(slot) = self.write().get_mut(peer.0 as usize) {
            slot.stats.overloads += 1;
            slot.backoff_until = Some(now + slot.backoff_length);
            debug!(%peer, backoff = ?slot.backoff_length, "Backing off peer");
            slot.backoff_length = (slot.backoff_length * 2).min(MAX_BACKOFF);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn location(value: f64) -> Location {
        Location::new(value).unwrap()
    }

    #[test]
    fn picks_closest_not_excluded() {
        let table = PeerTable::new();
        let far = table.add(location(0.9));
        let near = table.add(location(0.45));
        let target = location(0.5);

        let selected = table
            .select_next_hop(&HashSet::new(), target, false)
            .unwrap();
        assert_eq!(selected.id, near);

        let exclude = HashSet::from([near]);
        let selected = table.select_next_hop(&exclude, target, false).unwrap();
        assert_eq!(selected.id, far);

        let exclude = HashSet::from([near, far]);
        assert!(table.select_next_hop(&exclude, target, false).is_none());
    }

    #[test]
    fn distance_wraps() {
        let table = PeerTable::new();
        table.add(location(0.5));
        let wrapped = table.add(location(0.98));

        let selected = table
            .select_next_hop(&HashSet::new(), location(0.01), false)
            .unwrap();
        assert_eq!(selected.id, wrapped);
    }

    #[test]
    fn backed_off_peers_need_override() {
        let table = PeerTable::new();
        let peer = table.add(location(0.5));

        table.on_local_overload(peer);
        assert!(table.is_backed_off(peer));
        assert!(table
            .select_next_hop(&HashSet::new(), location(0.5), false)
            .is_none());
        assert_eq!(
            table
                .select_next_hop(&HashSet::new(), location(0.5), true)
                .map(|handle| handle.id),
            Some(peer)
        );
    }

    #[test]
    fn ties_prefer_lower_backoff() {
        let table = PeerTable::new();
        let backed_off = table.add(location(0.4));
        let fresh = table.add(location(0.6));
        table.on_local_overload(backed_off);

        let selected = table
            .select_next_hop(&HashSet::new(), location(0.5), true)
            .unwrap();
        assert_eq!(selected.id, fresh);
    }

    #[test]
    fn reconnect_changes_boot_id_and_keeps_coins() {
        let table = PeerTable::new();
        let peer = table.add_with_coins(location(0.5), HtlCoins::ALWAYS);
        let before = table.handle(peer).unwrap();

        table.disconnect(peer);
        assert!(!table.is_connected(&before));
        assert!(table.handle(peer).is_none());

        let after = table.reconnect(peer).unwrap();
        assert_ne!(after.boot_id, before.boot_id);
        assert_eq!(after.coins, HtlCoins::ALWAYS);
        assert!(!table.is_connected(&before));
        assert!(table.is_connected(&after));
    }

    #[test]
    fn stats_are_counted() {
        let table = PeerTable::new();
        let peer = table.add(location(0.5));

        table.on_success(peer);
        table.on_local_overload(peer);

        assert_eq!(
            table.stats(peer),
            Some(PeerStats {
                successes: 1,
                overloads: 1
            })
        );
    }
}
