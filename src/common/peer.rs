//! Handles to connected peers.
use std::fmt::{self, Display, Formatter};

use super::{HtlCoins, Location};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Stable index of a peer in the peer arena.
pub struct PeerId(pub u32);

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// Snapshot of a peer relationship, as returned by a [crate::PeerSelector].
pub struct PeerHandle {
    pub id: PeerId,
    pub location: Location,
    /// Changes every time the peer reconnects, so stale handles can be told apart.
    pub boot_id: u64,
    /// Boundary HTL coins, rolled once when the relationship was established.
    pub coins: HtlCoins,
}

impl PeerHandle {
    /// Creates a new PeerHandle.
    pub fn new(id: PeerId, location: Location, boot_id: u64, coins: HtlCoins) -> PeerHandle {
        PeerHandle {
            id,
            location,
            boot_id,
            coins,
        }
    }
}
