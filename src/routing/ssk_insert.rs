//! Drives one SSK insert chain.
//!
//! Subspace keys are first-writer-wins: when a hop already holds a different valid
//! block it answers with that block, and the chain carries the older block from then
//! on. The payload is small enough to travel inline, so there are no background
//! transfers to wait for.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, info, trace, warn};

use crate::common::{Htl, Message, MessageBody, MessageKind, PeerHandle, SskBlock, Uid};
use crate::node::NodeContext;
use crate::rpc::{MessageFilter, WaitResult};
use crate::server::{UidKind, UidLock};

use super::{spawn_chain, ForwarderEvent, Hop, InsertOutcome, InsertStatus, Route, Terminal};

const ACCEPT_KINDS: &[MessageKind] = &[
    MessageKind::SskAccepted,
    MessageKind::RejectedLoop,
    MessageKind::RejectedOverload,
];
const PUBKEY_ACCEPTED_KINDS: &[MessageKind] = &[MessageKind::SskPubKeyAccepted];
const REPLY_KINDS: &[MessageKind] = &[
    MessageKind::InsertReply,
    MessageKind::RouteNotFound,
    MessageKind::RejectedOverload,
    MessageKind::RejectedTimeout,
    MessageKind::DataInsertRejected,
    MessageKind::SskDataFoundHeaders,
];
const COLLISION_DATA_KINDS: &[MessageKind] = &[MessageKind::SskDataFoundData];

#[derive(Debug)]
pub(crate) struct SskInsertParams {
    pub block: SskBlock,
    pub uid: Uid,
    pub htl: Htl,
    pub source: Option<PeerHandle>,
    pub fork_on_cacheable: bool,
}

#[derive(Debug)]
pub(crate) struct SskInsertForwarder {
    ctx: Arc<NodeContext>,
    /// The block this chain carries, replaced on collision.
    block: SskBlock,
    uid: Uid,
    route: Route,
    fork_on_cacheable: bool,
    forked: Option<UidLock>,
    has_collided: bool,
    terminal: Terminal<InsertStatus>,
    events: Sender<ForwarderEvent<InsertOutcome>>,
    relayed_overload: bool,
}

impl SskInsertForwarder {
    pub fn new(
        ctx: Arc<NodeContext>,
        params: SskInsertParams,
    ) -> (Self, Receiver<ForwarderEvent<InsertOutcome>>) {
        let (events, receiver) = flume::unbounded();
        let target = params.block.key().routing_key().location();
        let route = Route::new(&ctx, target, params.htl, params.source);

        (
            Self {
                ctx,
                block: params.block,
                uid: params.uid,
                route,
                fork_on_cacheable: params.fork_on_cacheable,
                forked: None,
                has_collided: false,
                terminal: Terminal::new(),
                events,
                relayed_overload: false,
            },
            receiver,
        )
    }

    pub fn spawn(self) {
        let events = self.events.clone();
        spawn_chain(format!("ssk-insert-{}", self.uid), events, move || self.run());
    }

    fn run(mut self) {
        let status = self.search();
        self.finish(status);
    }

    fn search(&mut self) -> InsertStatus {
        loop {
            let (next, became_cacheable) = match self.route.next_hop(&self.ctx) {
                Hop::Next {
                    peer,
                    became_cacheable,
                } => (peer, became_cacheable),
                Hop::HtlExhausted if self.route.has_accepted() => return InsertStatus::Success,
                Hop::HtlExhausted | Hop::NoRoute => return InsertStatus::RouteNotFound,
            };

            if became_cacheable && self.fork_on_cacheable && self.forked.is_none() {
                self.fork(&next);
            }

            if let Some(status) = self.try_peer(&next) {
                return status;
            }
        }
    }

    /// Run one hop, `None` means try the next peer.
    fn try_peer(&mut self, next: &PeerHandle) -> Option<InsertStatus> {
        let uid = self.uid;
        let accepted_timeout = self.ctx.config.accepted_timeout;
        let search_timeout = self.ctx.config.search_timeout;

        let request = MessageBody::SskInsertRequest {
            htl: self.route.htl(),
            target: self.route.target(),
            key: *self.block.key(),
        };
        trace!(%uid, peer = %next.id, htl = self.route.htl(), "Routing SSK insert");
        if let Err(error) = self.ctx.send(next.id, uid, request) {
            debug!(%uid, %error, "Could not send SSK insert");
            return None;
        }
        self.route.mark_forwarded();

        let deadline = Instant::now() + accepted_timeout;
        let need_pub_key = loop {
            match self.wait_until(next, ACCEPT_KINDS, deadline) {
                WaitResult::Matched(message) => match message.body {
                    MessageBody::SskAccepted { need_pub_key } => {
                        self.route.mark_accepted();
                        break need_pub_key;
                    }
                    MessageBody::RejectedLoop => return None,
                    MessageBody::RejectedOverload { local: true } => {
                        self.ctx.peers.on_local_overload(next.id);
                        return None;
                    }
                    MessageBody::RejectedOverload { local: false } => self.relay_overload(),
                    _ => return None,
                },
                WaitResult::TimedOut => {
                    debug!(%uid, peer = %next.id, "Timed out waiting for SskAccepted");
                    self.ctx.peers.on_local_overload(next.id);
                    return None;
                }
                WaitResult::Disconnected | WaitResult::Cancelled => return None,
            }
        };

        let payload = [
            MessageBody::SskInsertRequestHeaders {
                headers: self.block.headers(),
            },
            MessageBody::SskInsertRequestData {
                data: self.block.data().clone(),
            },
        ];
        for body in payload {
            if self.ctx.send(next.id, uid, body).is_err() {
                return None;
            }
        }

        if need_pub_key {
            let pubkey = MessageBody::SskPubKey {
                pubkey: *self.block.pubkey(),
            };
            if self.ctx.send(next.id, uid, pubkey).is_err() {
                return None;
            }

            match self.wait(next, PUBKEY_ACCEPTED_KINDS, accepted_timeout) {
                WaitResult::Matched(_) => {}
                WaitResult::TimedOut => {
                    debug!(%uid, peer = %next.id, "Timed out waiting for SskPubKeyAccepted");
                    self.ctx.peers.on_local_overload(next.id);
                    self.relay_overload();
                    return None;
                }
                WaitResult::Disconnected | WaitResult::Cancelled => return None,
            }
        }

        let deadline = Instant::now() + search_timeout;
        loop {
            match self.wait_until(next, REPLY_KINDS, deadline) {
                WaitResult::Matched(message) => match message.body {
                    MessageBody::InsertReply => {
                        self.ctx.peers.on_success(next.id);
                        return Some(InsertStatus::Success);
                    }
                    MessageBody::RouteNotFound { htl } => {
                        self.ctx.peers.on_success(next.id);
                        self.route.adopt_htl(htl);
                        return None;
                    }
                    MessageBody::RejectedOverload { local: true } => {
                        self.ctx.peers.on_local_overload(next.id);
                        return None;
                    }
                    MessageBody::RejectedOverload { local: false } => self.relay_overload(),
                    MessageBody::RejectedTimeout => {
                        self.ctx.peers.on_local_overload(next.id);
                        return Some(InsertStatus::TimedOut);
                    }
                    MessageBody::DataInsertRejected { reason } => {
                        self.ctx.peers.on_success(next.id);
                        warn!(%uid, peer = %next.id, %reason, "SSK insert rejected");
                        return None;
                    }
                    MessageBody::SskDataFoundHeaders { headers } => {
                        if let Err(status) = self.collided(next, headers) {
                            return Some(status);
                        }
                    }
                    _ => return None,
                },
                WaitResult::TimedOut => {
                    warn!(%uid, peer = %next.id, "Timed out waiting for SSK insert reply");
                    self.ctx.peers.on_local_overload(next.id);
                    return Some(InsertStatus::GeneratedRejectedOverload);
                }
                WaitResult::Disconnected | WaitResult::Cancelled => return None,
            }
        }
    }

    /// A hop holds a block under this key already, adopt it if it differs.
    fn collided(&mut self, next: &PeerHandle, headers: Bytes) -> Result<(), InsertStatus> {
        let data = match self.wait(next, COLLISION_DATA_KINDS, self.ctx.config.accepted_timeout) {
            WaitResult::Matched(Message {
                body: MessageBody::SskDataFoundData { data },
                ..
            }) => data,
            _ => {
                debug!(uid = %self.uid, peer = %next.id, "Collision data never arrived");
                return Ok(());
            }
        };

        let existing =
            SskBlock::verify(self.block.key(), &headers, data, self.block.pubkey()).map_err(
                |error| {
                    warn!(uid = %self.uid, peer = %next.id, %error, "Colliding block does not verify");
                    InsertStatus::InternalError
                },
            )?;

        if existing != self.block {
            info!(uid = %self.uid, peer = %next.id, "SSK insert collided, carrying the older block");

            self.block = existing.clone();
            self.has_collided = true;
            let _ = self.events.send(ForwarderEvent::Collided(existing));
        }

        Ok(())
    }

    fn fork(&mut self, next: &PeerHandle) {
        let lock = UidLock::random(&self.ctx.uids, UidKind::SskInsert);

        info!(
            old = %self.uid,
            new = %lock.uid(),
            htl = self.route.htl(),
            "Forking SSK insert, now cacheable"
        );

        self.uid = lock.uid();
        self.forked = Some(lock);
        self.route.restart(next);
    }

    fn finish(&mut self, status: InsertStatus) {
        let status = match status {
            InsertStatus::RouteNotFound if !self.route.has_forwarded() => {
                InsertStatus::RouteReallyNotFound
            }
            status => status,
        };
        self.terminal.set(status);
        self.forked.take();

        debug!(
            uid = %self.uid,
            ?status,
            htl = self.route.htl(),
            has_collided = self.has_collided,
            "SSK insert finished"
        );

        let _ = self.events.send(ForwarderEvent::Finished(InsertOutcome {
            status,
            htl: self.route.htl(),
            any_transfers_failed: false,
            has_collided: self.has_collided,
            canonical: Some(self.block.clone()),
        }));
    }

    fn wait(&self, next: &PeerHandle, kinds: &'static [MessageKind], timeout: Duration) -> WaitResult {
        self.wait_until(next, kinds, Instant::now() + timeout)
    }

    fn wait_until(
        &self,
        next: &PeerHandle,
        kinds: &'static [MessageKind],
        deadline: Instant,
    ) -> WaitResult {
        self.ctx
            .dispatcher
            .wait_until(MessageFilter::new(self.uid, next.id, kinds), deadline, None)
    }

    fn relay_overload(&mut self) {
        if !self.relayed_overload {
            self.relayed_overload = true;
            let _ = self.events.send(ForwarderEvent::ForwardedOverload);
        }
    }
}
