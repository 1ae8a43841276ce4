//! Correlates inbound messages with the chains waiting for them.
//!
//! A waiter registers a [MessageFilter] (UID, source peer and accepted kinds) and
//! blocks on a channel until a matching message arrives, the timeout expires, the
//! source disconnects, or its [CancelToken] fires. Messages that arrive before
//! anyone waits for them are buffered for a short while.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::trace;

use crate::common::{Message, MessageKind, PeerId, Uid};

/// How long an unmatched message stays available for a late waiter.
pub const UNMATCHED_TTL: Duration = Duration::from_secs(30);
/// Maximum number of buffered unmatched messages.
pub const MAX_UNMATCHED: usize = 4096;

#[derive(Debug, Clone, Copy)]
/// Which messages a waiter is interested in.
pub struct MessageFilter {
    pub uid: Uid,
    pub source: PeerId,
    pub kinds: &'static [MessageKind],
}

impl MessageFilter {
    pub fn new(uid: Uid, source: PeerId, kinds: &'static [MessageKind]) -> Self {
        Self { uid, source, kinds }
    }

    pub fn matches(&self, from: PeerId, message: &Message) -> bool {
        self.source == from && self.uid == message.uid && self.kinds.contains(&message.kind())
    }
}

#[derive(Debug)]
/// Outcome of a correlated wait.
pub enum WaitResult {
    Matched(Message),
    TimedOut,
    /// The peer we were waiting on disconnected.
    Disconnected,
    Cancelled,
}

#[derive(Debug)]
enum Delivery {
    Message(Message),
    Disconnected,
}

#[derive(Debug)]
struct Pending {
    id: u64,
    filter: MessageFilter,
    sender: Sender<Delivery>,
    persistent: bool,
}

#[derive(Debug)]
struct Unmatched {
    received_at: Instant,
    from: PeerId,
    message: Message,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    pending: Vec<Pending>,
    unmatched: VecDeque<Unmatched>,
    cancel_on_disconnect: Vec<(u64, PeerId, Canceller)>,
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    inner: Mutex<Inner>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    // === Public Methods ===

    /// Hand an inbound message to whoever waits for it, returns `false` if it was buffered.
    pub fn deliver(&self, from: PeerId, message: Message) -> bool {
        let mut inner = self.lock();
        let mut message = message;

        while let Some(pos) = inner
            .pending
            .iter()
            .position(|pending| pending.filter.matches(from, &message))
        {
            let persistent = inner.pending[pos].persistent;

            match inner.pending[pos].sender.send(Delivery::Message(message)) {
                Ok(()) => {
                    if !persistent {
                        inner.pending.remove(pos);
                    }
                    return true;
                }
                Err(flume::SendError(delivery)) => {
                    // Waiter is gone, try the next one.
                    inner.pending.remove(pos);
                    match delivery {
                        Delivery::Message(returned) => message = returned,
                        Delivery::Disconnected => return false,
                    }
                }
            }
        }

        trace!(uid = %message.uid, kind = ?message.kind(), %from, "Buffering unmatched message");

        let now = Instant::now();
        inner.prune(now);
        if inner.unmatched.len() >= MAX_UNMATCHED {
            inner.unmatched.pop_front();
        }
        inner.unmatched.push_back(Unmatched {
            received_at: now,
            from,
            message,
        });

        false
    }

    /// Wake every waiter on `peer`, forget its buffered messages, and cancel chains
    /// registered with [Dispatcher::cancel_on_disconnect].
    pub fn peer_disconnected(&self, peer: PeerId) {
        let mut inner = self.lock();

        inner.pending.retain(|pending| {
            if pending.filter.source == peer {
                let _ = pending.sender.send(Delivery::Disconnected);
                false
            } else {
                true
            }
        });
        inner.unmatched.retain(|unmatched| unmatched.from != peer);
        inner.cancel_on_disconnect.retain(|(_, watched, canceller)| {
            if *watched == peer {
                canceller.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Wait once for a message matching `filter`.
    pub fn wait_for(
        &self,
        filter: MessageFilter,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> WaitResult {
        self.wait_until(filter, Instant::now() + timeout, cancel)
    }

    /// Wait once for a message matching `filter`, giving up at `deadline`.
    pub fn wait_until(
        &self,
        filter: MessageFilter,
        deadline: Instant,
        cancel: Option<&CancelToken>,
    ) -> WaitResult {
        let (id, receiver) = self.register(filter, false);
        let result = wait_on(&receiver, deadline, cancel);
        self.unregister(id);

        result
    }

    /// Receive every message matching `filter` until the [Subscription] is dropped.
    pub fn subscribe(self: &Arc<Self>, filter: MessageFilter) -> Subscription {
        let (id, receiver) = self.register(filter, true);

        Subscription {
            dispatcher: self.clone(),
            id,
            receiver,
        }
    }

    /// Cancel `canceller` if `peer` disconnects, until [Dispatcher::forget_disconnect] is called.
    pub fn cancel_on_disconnect(&self, peer: PeerId, canceller: Canceller) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.cancel_on_disconnect.push((id, peer, canceller));

        id
    }

    pub fn forget_disconnect(&self, id: u64) {
        self.lock()
            .cancel_on_disconnect
            .retain(|(watch_id, _, _)| *watch_id != id);
    }

    /// Number of registered waiters, mostly for tests.
    pub fn waiting(&self) -> usize {
        self.lock().pending.len()
    }

    // === Private Methods ===

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, filter: MessageFilter, persistent: bool) -> (u64, Receiver<Delivery>) {
        let (sender, receiver) = flume::unbounded();
        let mut inner = self.lock();
        inner.prune(Instant::now());

        let mut matched = false;
        let mut i = 0;
        while i < inner.unmatched.len() {
            if filter.matches(inner.unmatched[i].from, &inner.unmatched[i].message) {
                if let Some(unmatched) = inner.unmatched.remove(i) {
                    let _ = sender.send(Delivery::Message(unmatched.message));
                    matched = true;
                }
                if !persistent {
                    break;
                }
                continue;
            }
            i += 1;
        }

        let id = inner.next_id();
        if persistent || !matched {
            inner.pending.push(Pending {
                id,
                filter,
                sender,
                persistent,
            });
        }

        (id, receiver)
    }

    fn unregister(&self, id: u64) {
        self.lock().pending.retain(|pending| pending.id != id);
    }
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.unmatched.front() {
            if now.duration_since(oldest.received_at) < UNMATCHED_TTL {
                break;
            }
            self.unmatched.pop_front();
        }
    }
}

#[derive(Debug)]
/// A persistent registration, used for streams such as block packets.
pub struct Subscription {
    dispatcher: Arc<Dispatcher>,
    id: u64,
    receiver: Receiver<Delivery>,
}

impl Subscription {
    /// Wait for the next matching message.
    pub fn recv(&self, timeout: Duration, cancel: Option<&CancelToken>) -> WaitResult {
        wait_on(&self.receiver, Instant::now() + timeout, cancel)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.unregister(self.id);
    }
}

fn wait_on(
    receiver: &Receiver<Delivery>,
    deadline: Instant,
    cancel: Option<&CancelToken>,
) -> WaitResult {
    let Some(cancel) = cancel else {
        return match receiver.recv_deadline(deadline) {
            Ok(delivery) => delivery.into(),
            Err(RecvTimeoutError::Timeout) => WaitResult::TimedOut,
            Err(RecvTimeoutError::Disconnected) => WaitResult::Disconnected,
        };
    };

    if cancel.is_cancelled() {
        return WaitResult::Cancelled;
    }

    flume::Selector::new()
        .recv(receiver, |delivery| match delivery {
            Ok(delivery) => delivery.into(),
            Err(_) => WaitResult::Disconnected,
        })
        .recv(&cancel.0, |_| WaitResult::Cancelled)
        .wait_deadline(deadline)
        .unwrap_or(WaitResult::TimedOut)
}

impl From<Delivery> for WaitResult {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Message(message) => WaitResult::Matched(message),
            Delivery::Disconnected => WaitResult::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
/// Cancels every [CancelToken] created with it, explicitly or when the last clone is dropped.
pub struct Canceller(Arc<Mutex<Option<Sender<()>>>>);

#[derive(Debug, Clone)]
/// Observed by waits that must be cut short when their chain becomes irrelevant.
pub struct CancelToken(Receiver<()>);

/// Create a linked [Canceller] and [CancelToken].
pub fn cancel_pair() -> (Canceller, CancelToken) {
    let (sender, receiver) = flume::bounded(1);

    (
        Canceller(Arc::new(Mutex::new(Some(sender)))),
        CancelToken(receiver),
    )
}

impl Canceller {
    pub fn cancel(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.is_disconnected()
    }
}
