//! Answers inbound requests, and owns the node's local state: blocks, public keys,
//! UID locks and recent failures.

mod failure_table;
mod insert;
mod request;
mod ssk_insert;
mod store;
mod tracker;

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use tracing::error;

pub use failure_table::{FailureTable, RecentFailures, MAX_FAILED_KEYS};
pub use store::{BlockStore, LruStore, PubKeyCache, MAX_BLOCKS, MAX_PUBKEYS};
pub use tracker::{UidKind, UidLock, UidRegistry, UidTracker};

pub(crate) use insert::InsertHandler;
pub(crate) use request::RequestHandler;
pub(crate) use ssk_insert::SskInsertHandler;

/// Run an inbound handler on its own thread.
///
/// A panicking handler only logs, its UID lock is released while unwinding.
pub(crate) fn spawn_handler<F>(name: String, body: F)
where
    F: FnOnce() + Send + 'static,
{
    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
            error!(handler = name, "Handler panicked");
        }
    });

    if let Err(error) = spawned {
        error!(?error, "Could not spawn handler thread");
    }
}
