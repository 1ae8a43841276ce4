use std::time::Duration;

use crate::common::{Htl, HtlPolicy, DEFAULT_MAX_HTL};

use super::{
    BlockGeometry, DEFAULT_ACCEPTED_TIMEOUT, DEFAULT_COMPLETION_POLL_INTERVAL,
    DEFAULT_DATA_INSERT_TIMEOUT, DEFAULT_PACKET_TIMEOUT, DEFAULT_SEARCH_TIMEOUT,
    DEFAULT_TRANSFER_COMPLETION_TIMEOUT,
};

#[derive(Debug, Clone)]
/// Node Configurations
pub struct Config {
    /// Maximum, and initial, HTL of a chain.
    ///
    /// Defaults to [DEFAULT_MAX_HTL]
    pub max_htl: Htl,
    /// How long to wait for a hop to accept or reject a request.
    ///
    /// Defaults to [DEFAULT_ACCEPTED_TIMEOUT]
    pub accepted_timeout: Duration,
    /// How long to wait for the outcome of a search once a hop accepted it.
    ///
    /// This covers the whole remaining chain behind the hop, so it is much longer
    /// than `accepted_timeout`.
    ///
    /// Defaults to [DEFAULT_SEARCH_TIMEOUT]
    pub search_timeout: Duration,
    /// How long a handler waits for the payload of an insert it accepted.
    ///
    /// Defaults to [DEFAULT_DATA_INSERT_TIMEOUT]
    pub data_insert_timeout: Duration,
    /// Upper bound, counted from terminality, on waiting for downstream transfers of an insert.
    ///
    /// Defaults to [DEFAULT_TRANSFER_COMPLETION_TIMEOUT]
    pub transfer_completion_timeout: Duration,
    /// Poll interval for downstream completion notices and local receive failures.
    ///
    /// Defaults to [DEFAULT_COMPLETION_POLL_INTERVAL]
    pub completion_poll_interval: Duration,
    /// How long a block transfer waits for its next packet.
    ///
    /// Defaults to [DEFAULT_PACKET_TIMEOUT]
    pub packet_timeout: Duration,
    /// Retries that do not spend HTL before routing gives up.
    ///
    /// Defaults to `5`
    pub max_backtracks: u8,
    /// Number of hops after `max_htl` during which inserts are not cached locally.
    ///
    /// Defaults to `2`
    pub uncacheable_hops: Htl,
    /// Restart an insert under a new UID once it becomes cacheable.
    ///
    /// Defaults to `true`
    pub fork_on_cacheable: bool,
    /// Cache every insert locally, whatever its HTL.
    ///
    /// Defaults to `false`
    pub write_local_to_datastore: bool,
    /// Number of chains this node runs at once before rejecting new ones as overloaded.
    ///
    /// Defaults to `256`
    pub max_running_chains: usize,
    /// Capacity of each key type in the default block store.
    ///
    /// Defaults to `1000`
    pub store_capacity: usize,
    /// Capacity of the public key cache.
    ///
    /// Defaults to `1000`
    pub pubkey_cache_capacity: usize,
    /// How long a key that was not found is failed fast.
    ///
    /// Defaults to 10 minutes
    pub recently_failed_timeout: Duration,
    /// Size and packetization of CHK blocks.
    ///
    /// Defaults to 32 packets of 1024 bytes.
    pub block: BlockGeometry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_htl: DEFAULT_MAX_HTL,
            accepted_timeout: DEFAULT_ACCEPTED_TIMEOUT,
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
            data_insert_timeout: DEFAULT_DATA_INSERT_TIMEOUT,
            transfer_completion_timeout: DEFAULT_TRANSFER_COMPLETION_TIMEOUT,
            completion_poll_interval: DEFAULT_COMPLETION_POLL_INTERVAL,
            packet_timeout: DEFAULT_PACKET_TIMEOUT,
            max_backtracks: 5,
            uncacheable_hops: 2,
            fork_on_cacheable: true,
            write_local_to_datastore: false,
            max_running_chains: 256,
            store_capacity: 1000,
            pubkey_cache_capacity: 1000,
            recently_failed_timeout: Duration::from_secs(10 * 60),
            block: BlockGeometry::default(),
        }
    }
}

impl Config {
    pub fn htl_policy(&self) -> HtlPolicy {
        HtlPolicy {
            max_htl: self.max_htl,
            uncacheable_hops: self.uncacheable_hops,
            write_local_to_datastore: self.write_local_to_datastore,
        }
    }
}
