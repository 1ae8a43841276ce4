//! Hops-To-Live accounting.
//!
//! At the two boundary values (`max_htl` and `1`) a decrement only happens if the
//! per-peer coin says so. The coins are rolled once when a peer is registered, so
//! repeated probing through the same peer always sees the same behaviour.

use rand::Rng;

/// Hops-To-Live, in `0..=max_htl`.
pub type Htl = u8;

/// Default maximum HTL.
pub const DEFAULT_MAX_HTL: Htl = 10;

/// Probability that a peer relationship decrements at `max_htl`.
pub const DECREMENT_AT_MAX_PROBABILITY: f64 = 0.5;
/// Probability that a peer relationship decrements at `1`.
pub const DECREMENT_AT_MIN_PROBABILITY: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Boundary decrement coins of one peer relationship.
pub struct HtlCoins {
    pub decrement_at_max: bool,
    pub decrement_at_min: bool,
}

impl HtlCoins {
    /// Coins that always decrement, useful for deterministic setups.
    pub const ALWAYS: HtlCoins = HtlCoins {
        decrement_at_max: true,
        decrement_at_min: true,
    };

    /// Coins that never decrement at the boundaries.
    pub const NEVER: HtlCoins = HtlCoins {
        decrement_at_max: false,
        decrement_at_min: false,
    };

    pub fn random() -> HtlCoins {
        let mut rng = rand::thread_rng();

        HtlCoins {
            decrement_at_max: rng.gen_bool(DECREMENT_AT_MAX_PROBABILITY),
            decrement_at_min: rng.gen_bool(DECREMENT_AT_MIN_PROBABILITY),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// HTL rules of one node.
pub struct HtlPolicy {
    pub max_htl: Htl,
    /// Number of hops after `max_htl` during which an insert is not cached.
    pub uncacheable_hops: Htl,
    pub write_local_to_datastore: bool,
}

impl HtlPolicy {
    /// Decrement `htl` once, honouring the boundary coins.
    pub fn decrement(&self, htl: Htl, coins: HtlCoins) -> Htl {
        let htl = htl.clamp(1, self.max_htl.max(1));

        if htl == self.max_htl && !coins.decrement_at_max {
            return htl;
        }
        if htl == 1 && !coins.decrement_at_min {
            return htl;
        }

        htl - 1
    }

    /// Whether an insert seen at `htl` may be written to the local store.
    pub fn can_write_datastore(&self, htl: Htl) -> bool {
        self.write_local_to_datastore || htl <= self.max_htl.saturating_sub(self.uncacheable_hops)
    }

    /// Clamp an inbound HTL to this node's maximum.
    pub fn clamp(&self, htl: Htl) -> Htl {
        htl.min(self.max_htl)
    }
}
