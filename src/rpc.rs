//! Message plumbing between adjacent hops: configuration, correlation, transport
//! and block transfer.

mod config;
mod dispatcher;
mod transfer;
mod transport;

use std::time::Duration;

pub use config::Config;
pub use dispatcher::{
    cancel_pair, CancelToken, Canceller, Dispatcher, MessageFilter, Subscription, WaitResult,
    MAX_UNMATCHED, UNMATCHED_TTL,
};
pub use transfer::{
    BlockGeometry, BlockReceiver, BlockTransmitter, PartialBlock, TransferError,
    PACKETS_IN_BLOCK, PACKET_SIZE,
};
pub use transport::{NotConnected, Transport};

/// Default time a hop has to accept or reject a request.
pub const DEFAULT_ACCEPTED_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time to wait for the outcome of an accepted search.
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(120);
/// Default time a handler waits for the payload of an accepted insert.
pub const DEFAULT_DATA_INSERT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on waiting for downstream transfers once an insert is terminal.
pub const DEFAULT_TRANSFER_COMPLETION_TIMEOUT: Duration = Duration::from_secs(120);
/// Default poll interval of completion and receive-failure checks.
pub const DEFAULT_COMPLETION_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default time to wait for the next packet of a block.
pub const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_secs(30);
