//! Hop-by-hop forwarding of requests and inserts.
//!
//! Each chain is driven by one forwarder running on its own thread. The forwarder
//! reports to whoever started it (a handler, or the local originator) through a
//! channel of [ForwarderEvent]s, ending with exactly one `Finished`.

mod insert;
pub mod peers;
mod request;
mod ssk_insert;

use std::collections::HashSet;
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use flume::{Receiver, Sender};
use tracing::{debug, error, trace};

use crate::common::{Htl, Location, PeerHandle, PeerId, SskBlock};
use crate::node::NodeContext;

pub use insert::{DownstreamCompletion, InsertOutcome, InsertStatus};
pub use peers::{PeerSelector, PeerStats, PeerTable};
pub use request::{RequestOutcome, RequestStatus};

pub(crate) use insert::{InsertForwarder, InsertParams};
pub(crate) use request::RequestForwarder;
pub(crate) use ssk_insert::{SskInsertForwarder, SskInsertParams};

#[derive(Debug)]
/// What a forwarder tells its owner.
pub(crate) enum ForwarderEvent<O> {
    /// A hop further away is overloaded, relay it upstream once.
    ForwardedOverload,
    /// An SSK insert met a different, older block and carries that one from now on.
    Collided(SskBlock),
    Finished(O),
    /// The forwarder thread died without reporting.
    Crashed,
}

/// Block until the forwarder reports its outcome, `None` if it crashed.
pub(crate) fn await_finished<O>(events: &Receiver<ForwarderEvent<O>>) -> Option<O> {
    loop {
        match events.recv() {
            Ok(ForwarderEvent::Finished(outcome)) => return Some(outcome),
            Ok(ForwarderEvent::Crashed) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Run a chain on its own thread, turning a panic into [ForwarderEvent::Crashed].
pub(crate) fn spawn_chain<O, F>(name: String, events: Sender<ForwarderEvent<O>>, body: F)
where
    O: Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let report = events.clone();

    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        if panic::catch_unwind(AssertUnwindSafe(body)).is_err() {
            error!(chain = name, "Chain panicked");
            let _ = events.send(ForwarderEvent::Crashed);
        }
    });

    if let Err(error) = spawned {
        error!(?error, "Could not spawn chain thread");
        let _ = report.send(ForwarderEvent::Crashed);
    }
}

#[derive(Debug)]
/// Terminal status of a chain, set at most once.
pub(crate) struct Terminal<S>(Option<S>);

impl<S: Copy + Debug> Terminal<S> {
    pub fn new() -> Self {
        Terminal(None)
    }

    pub fn set(&mut self, status: S) {
        if let Some(previous) = self.0 {
            panic!(
                "terminal status set twice: {:?} then {:?}",
                previous, status
            );
        }
        self.0 = Some(status);
    }

    pub fn get(&self) -> Option<S> {
        self.0
    }
}

#[derive(Debug)]
pub(crate) enum Hop {
    Next {
        peer: PeerHandle,
        /// This hop's HTL made the chain locally cacheable for the first time.
        became_cacheable: bool,
    },
    HtlExhausted,
    NoRoute,
}

#[derive(Debug)]
/// Routing state of one chain on this node.
pub(crate) struct Route {
    target: Location,
    htl: Htl,
    best_distance: f64,
    source: Option<PeerHandle>,
    /// Peers tried for this UID, never tried twice.
    excluded: HashSet<PeerId>,
    /// Peers selected despite their backoff.
    backoff_overridden: HashSet<PeerId>,
    backtracks: u8,
    attempts: u32,
    has_forwarded: bool,
    has_accepted: bool,
    last_tried: Option<PeerHandle>,
}

impl Route {
    pub fn new(ctx: &NodeContext, target: Location, htl: Htl, source: Option<PeerHandle>) -> Self {
        let mut excluded = HashSet::new();
        if let Some(source) = &source {
            excluded.insert(source.id);
        }

        Self {
            target,
            htl: ctx.config.htl_policy().clamp(htl),
            best_distance: ctx.location.distance(target),
            source,
            excluded,
            backoff_overridden: HashSet::new(),
            backtracks: 0,
            attempts: 0,
            has_forwarded: false,
            has_accepted: false,
            last_tried: None,
        }
    }

    // === Getters ===

    pub fn target(&self) -> Location {
        self.target
    }

    pub fn htl(&self) -> Htl {
        self.htl
    }

    /// Whether a request was ever handed to a peer.
    pub fn has_forwarded(&self) -> bool {
        self.has_forwarded
    }

    /// Whether some hop accepted this chain.
    pub fn has_accepted(&self) -> bool {
        self.has_accepted
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    // === Public Methods ===

    pub fn mark_forwarded(&mut self) {
        self.has_forwarded = true;
    }

    pub fn mark_accepted(&mut self) {
        self.has_accepted = true;
    }

    /// Take on the lower HTL a hop reported with `RouteNotFound`.
    pub fn adopt_htl(&mut self, htl: Htl) {
        self.htl = self.htl.min(htl);
    }

    /// Start over with an empty exclusion set, as a forked chain under a new UID.
    ///
    /// `next` is the peer about to receive the first request of the new chain.
    pub fn restart(&mut self, next: &PeerHandle) {
        self.excluded.clear();
        self.backoff_overridden.clear();
        self.excluded.insert(next.id);
    }

    /// Select the next hop and spend HTL for it.
    pub fn next_hop(&mut self, ctx: &NodeContext) -> Hop {
        if self.htl == 0 {
            return Hop::HtlExhausted;
        }

        let candidate = match ctx.peers.select_next_hop(&self.excluded, self.target, false) {
            Some(peer) => peer,
            None => match ctx.peers.select_next_hop(&self.excluded, self.target, true) {
                Some(peer) => {
                    trace!(peer = %peer.id, "Overriding backoff");
                    self.backoff_overridden.insert(peer.id);
                    peer
                }
                None => return Hop::NoRoute,
            },
        };

        let policy = ctx.config.htl_policy();
        let was_cacheable = policy.can_write_datastore(self.htl);
        let distance = candidate.location.distance(self.target);
        let farther = distance > self.best_distance;

        if self.attempts == 0 {
            if farther {
                let coins = self.source.map(|source| source.coins).unwrap_or(ctx.coins);
                self.htl = policy.decrement(self.htl, coins);
            }
        } else {
            let before = self.htl;
            if farther {
                let coins = self.last_tried.map(|peer| peer.coins).unwrap_or(ctx.coins);
                self.htl = policy.decrement(self.htl, coins);
            }

            if self.htl == before {
                self.backtracks += 1;
                if self.backtracks > ctx.config.max_backtracks {
                    debug!(backtracks = self.backtracks, "Too many backtracks");
                    return Hop::NoRoute;
                }
            }
        }

        if self.htl == 0 {
            trace!(peer = %candidate.id, "HTL spent before reaching the next hop");
            return Hop::HtlExhausted;
        }

        self.best_distance = self.best_distance.min(distance);

        if !self.excluded.insert(candidate.id) {
            error!(peer = %candidate.id, "Selector returned an excluded peer");
            return Hop::NoRoute;
        }
        self.attempts += 1;
        self.last_tried = Some(candidate);

        Hop::Next {
            peer: candidate,
            became_cacheable: !was_cacheable && policy.can_write_datastore(self.htl),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::common::HtlCoins;
    use crate::node::test::scripted_node;
    use crate::rpc::Config;

    pub(crate) fn location(value: f64) -> Location {
        Location::new(value).unwrap()
    }

    #[test]
    #[should_panic(expected = "terminal status set twice")]
    fn terminal_status_is_set_once() {
        let mut terminal = Terminal::new();
        terminal.set(InsertStatus::Success);
        assert_eq!(terminal.get(), Some(InsertStatus::Success));

        terminal.set(InsertStatus::RouteNotFound);
    }

    #[test]
    fn no_peers_is_no_route() {
        let (node, _network) = scripted_node(Config::default(), location(0.0), &[]);
        let mut route = Route::new(node.context(), location(0.5), 10, None);

        assert!(matches!(route.next_hop(node.context()), Hop::NoRoute));
        assert!(!route.has_forwarded());
    }

    #[test]
    fn zero_htl_is_exhausted() {
        let (node, _network) = scripted_node(Config::default(), location(0.0), &[0.5]);
        let mut route = Route::new(node.context(), location(0.5), 0, None);

        assert!(matches!(route.next_hop(node.context()), Hop::HtlExhausted));
    }

    #[test]
    fn spending_the_last_hop_is_exhausted() {
        let (node, _network) = scripted_node(Config::default(), location(0.5), &[0.9]);
        let mut route = Route::new(node.context(), location(0.5), 1, None);

        // Farther than this node, and the node's coins decrement at 1.
        assert!(matches!(route.next_hop(node.context()), Hop::HtlExhausted));
        assert_eq!(route.htl(), 0);
        assert_eq!(route.attempts(), 0);
    }

    #[test]
    fn source_is_excluded() {
        let (node, network) = scripted_node(Config::default(), location(0.0), &[0.5, 0.6]);
        let source = network.peer(0);
        let mut route = Route::new(node.context(), location(0.5), 10, Some(source));

        match route.next_hop(node.context()) {
            Hop::Next { peer, .. } => assert_eq!(peer.id, network.peer(1).id),
            hop => panic!("unexpected {:?}", hop),
        }
        assert!(matches!(route.next_hop(node.context()), Hop::NoRoute));
    }

    #[test]
    fn closer_first_hop_keeps_htl() {
        let (node, _network) = scripted_node(Config::default(), location(0.0), &[0.45]);
        let mut route = Route::new(node.context(), location(0.5), 10, None);

        assert!(matches!(route.next_hop(node.context()), Hop::Next { .. }));
        assert_eq!(route.htl(), 10);
    }

    #[test]
    fn attempts_are_bounded_by_htl_and_backtracks() {
        let config = Config {
            max_backtracks: 3,
            ..Config::default()
        };
        let locations: Vec<f64> = (0..40).map(|i| 0.5 + i as f64 * 0.01).collect();
        let (node, _network) = scripted_node(config, location(0.5), &locations);
        let initial_htl = 4;
        let mut route = Route::new(node.context(), location(0.5), initial_htl, None);

        let mut tried = HashSet::new();
        while let Hop::Next { peer, .. } = route.next_hop(node.context()) {
            assert!(tried.insert(peer.id), "peer tried twice");
        }

        assert!(route.attempts() <= 1 + initial_htl as u32 + 3);
    }

    #[test]
    fn crossing_into_cacheable_is_reported_once() {
        let (node, network) = scripted_node(Config::default(), location(0.5), &[0.9, 0.8]);
        let mut route = Route::new(node.context(), location(0.5), 9, None);

        // farther than this node: decrement 9 -> 8 with the node's coins
        match route.next_hop(node.context()) {
            Hop::Next {
                peer,
                became_cacheable,
            } => {
                assert_eq!(peer.id, network.peer(1).id);
                assert!(became_cacheable);
            }
            hop => panic!("unexpected {:?}", hop),
        }
        assert_eq!(route.htl(), 8);

        match route.next_hop(node.context()) {
            Hop::Next {
                became_cacheable, ..
            } => assert!(!became_cacheable),
            hop => panic!("unexpected {:?}", hop),
        }
    }

    #[test]
    fn restart_clears_exclusions() {
        let (node, network) = scripted_node(Config::default(), location(0.0), &[0.5, 0.6]);
        let source = network.peer(0);
        let mut route = Route::new(node.context(), location(0.5), 10, Some(source));

        let Hop::Next { peer, .. } = route.next_hop(node.context()) else {
            panic!("expected a hop")
        };
        route.restart(&peer);

        match route.next_hop(node.context()) {
            Hop::Next { peer, .. } => assert_eq!(peer.id, source.id),
            hop => panic!("unexpected {:?}", hop),
        }
    }

    #[test]
    fn boundary_coin_decides_decrement_at_max() {
        let (node, network) = scripted_node(Config::default(), location(0.45), &[0.0, 0.9]);

        for (coins, expected) in [(HtlCoins::NEVER, 10), (HtlCoins::ALWAYS, 9)] {
            let source = PeerHandle {
                coins,
                ..network.peer(0)
            };
            let mut route = Route::new(node.context(), location(0.5), 10, Some(source));

            // The only candidate is farther from the target than this node.
            assert!(matches!(route.next_hop(node.context()), Hop::Next { .. }));
            assert_eq!(route.htl(), expected);
        }
    }
}
