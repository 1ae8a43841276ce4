//! Drives one GET chain hop by hop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::common::{
    AbortReason, Block, ChkBlock, ChkKey, Htl, Key, Message, MessageBody, MessageKind,
    PeerHandle, SskBlock, SskKey, Uid,
};
use crate::node::NodeContext;
use crate::rpc::{
    BlockReceiver, CancelToken, MessageFilter, PartialBlock, TransferError, WaitResult,
};

use super::{spawn_chain, ForwarderEvent, Hop, Route, Terminal};

const ACCEPT_KINDS: &[MessageKind] = &[
    MessageKind::Accepted,
    MessageKind::RejectedLoop,
    MessageKind::RejectedOverload,
];
const REPLY_KINDS: &[MessageKind] = &[
    MessageKind::DataNotFound,
    MessageKind::DataFound,
    MessageKind::RouteNotFound,
    MessageKind::RejectedOverload,
    MessageKind::SskDataFoundHeaders,
];
const SSK_DATA_KINDS: &[MessageKind] = &[MessageKind::SskDataFoundData];
const SSK_PUBKEY_KINDS: &[MessageKind] = &[MessageKind::SskPubKey];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Terminal status of a GET chain.
pub enum RequestStatus {
    Success,
    RouteNotFound,
    DataNotFound,
    RejectedOverload,
    VerifyFailure,
    TransferFailed,
    /// The key failed recently at this HTL or higher, nothing was routed.
    RecentlyFailed,
    /// The predecessor went away.
    Cancelled,
    InternalError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub status: RequestStatus,
    /// HTL the chain ended with.
    pub htl: Htl,
    /// The verified block, on success.
    pub block: Option<Block>,
}

type Step = Option<(RequestStatus, Option<Block>)>;

#[derive(Debug)]
pub(crate) struct RequestForwarder {
    ctx: Arc<NodeContext>,
    key: Key,
    uid: Uid,
    route: Route,
    source: Option<PeerHandle>,
    cancel: Option<CancelToken>,
    terminal: Terminal<RequestStatus>,
    events: Sender<ForwarderEvent<RequestOutcome>>,
    /// Some hop was overloaded or did not accept in time.
    overloaded: bool,
    relayed_overload: bool,
}

impl RequestForwarder {
    pub fn new(
        ctx: Arc<NodeContext>,
        key: Key,
        uid: Uid,
        htl: Htl,
        source: Option<PeerHandle>,
        cancel: Option<CancelToken>,
    ) -> (Self, Receiver<ForwarderEvent<RequestOutcome>>) {
        let (events, receiver) = flume::unbounded();
        let route = Route::new(&ctx, key.location(), htl, source);

        (
            Self {
                ctx,
                key,
                uid,
                route,
                source,
                cancel,
                terminal: Terminal::new(),
                events,
                overloaded: false,
                relayed_overload: false,
            },
            receiver,
        )
    }

    pub fn spawn(self) {
        let events = self.events.clone();
        spawn_chain(format!("request-{}", self.uid), events, move || self.run());
    }

    fn run(mut self) {
        let (status, block) = self.search();
        self.finish(status, block);
    }

    fn search(&mut self) -> (RequestStatus, Option<Block>) {
        let requestor = self.source.map(|source| source.id);
        if self
            .ctx
            .failure_table
            .should_fail(&self.key, self.route.htl(), requestor)
        {
            return (RequestStatus::RecentlyFailed, None);
        }

        loop {
            if self.is_cancelled() {
                return (RequestStatus::Cancelled, None);
            }

            let next = match self.route.next_hop(&self.ctx) {
                Hop::Next { peer, .. } => peer,
                Hop::HtlExhausted => return (RequestStatus::RouteNotFound, None),
                Hop::NoRoute if self.overloaded => return (RequestStatus::RejectedOverload, None),
                Hop::NoRoute => return (RequestStatus::RouteNotFound, None),
            };

            if let Some(result) = self.try_peer(&next) {
                return result;
            }
        }
    }

    /// Run one hop, `None` means try the next peer.
    fn try_peer(&mut self, next: &PeerHandle) -> Step {
        let htl = self.route.htl();
        let target = self.route.target();
        let known_pubkey = match self.key {
            Key::Ssk(key) => self.ctx.pubkeys.get(&key.pubkey_hash),
            Key::Chk(_) => None,
        };

        let request = match self.key {
            Key::Chk(key) => MessageBody::ChkDataRequest { htl, target, key },
            Key::Ssk(key) => MessageBody::SskDataRequest {
                htl,
                target,
                key,
                need_pub_key: known_pubkey.is_none(),
            },
        };

        trace!(uid = %self.uid, peer = %next.id, htl, "Routing request");
        if let Err(error) = self.ctx.send(next.id, self.uid, request) {
            debug!(uid = %self.uid, %error, "Could not send request");
            return None;
        }
        self.route.mark_forwarded();

        let deadline = Instant::now() + self.ctx.config.accepted_timeout;
        loop {
            match self.wait_until(next, ACCEPT_KINDS, deadline) {
                WaitResult::Matched(message) => match message.body {
                    MessageBody::Accepted => break,
                    MessageBody::RejectedLoop => return None,
                    MessageBody::RejectedOverload { local: true } => {
                        self.local_overload(next);
                        return None;
                    }
                    MessageBody::RejectedOverload { local: false } => self.relay_overload(),
                    _ => return None,
                },
                WaitResult::TimedOut => {
                    debug!(uid = %self.uid, peer = %next.id, "Timed out waiting for Accepted");
                    self.local_overload(next);
                    return None;
                }
                WaitResult::Disconnected => return None,
                WaitResult::Cancelled => return Some((RequestStatus::Cancelled, None)),
            }
        }

        let deadline = Instant::now() + self.ctx.config.search_timeout;
        loop {
            match self.wait_until(next, REPLY_KINDS, deadline) {
                WaitResult::Matched(message) => match (message.body, self.key) {
                    (MessageBody::DataNotFound, _) => {
                        self.ctx.peers.on_success(next.id);
                        self.ctx.failure_table.on_failed(
                            &self.key,
                            next,
                            self.route.htl(),
                            self.ctx.config.recently_failed_timeout,
                        );
                        return Some((RequestStatus::DataNotFound, None));
                    }
                    (MessageBody::RouteNotFound { htl }, _) => {
                        self.ctx.peers.on_success(next.id);
                        self.route.adopt_htl(htl);
                        return None;
                    }
                    (MessageBody::RejectedOverload { local: true }, _) => {
                        self.local_overload(next);
                        return None;
                    }
                    (MessageBody::RejectedOverload { local: false }, _) => self.relay_overload(),
                    (MessageBody::DataFound { headers }, Key::Chk(key)) => {
                        self.ctx.peers.on_success(next.id);
                        return Some(self.receive_chk(next, key, headers));
                    }
                    (MessageBody::SskDataFoundHeaders { headers }, Key::Ssk(key)) => {
                        self.ctx.peers.on_success(next.id);
                        return Some(self.receive_ssk(next, key, headers, known_pubkey));
                    }
                    (body, _) => {
                        debug!(uid = %self.uid, peer = %next.id, ?body, "Unexpected reply");
                        return None;
                    }
                },
                WaitResult::TimedOut => {
                    warn!(uid = %self.uid, peer = %next.id, "Timed out waiting for search reply");
                    self.ctx.peers.on_local_overload(next.id);
                    return Some((RequestStatus::RejectedOverload, None));
                }
                WaitResult::Disconnected => return None,
                WaitResult::Cancelled => return Some((RequestStatus::Cancelled, None)),
            }
        }
    }

    fn receive_chk(
        &mut self,
        next: &PeerHandle,
        key: ChkKey,
        headers: Bytes,
    ) -> (RequestStatus, Option<Block>) {
        let block = PartialBlock::new(self.ctx.config.block);

        let received = BlockReceiver {
            dispatcher: &self.ctx.dispatcher,
            from: next.id,
            uid: self.uid,
            block: &block,
            packet_timeout: self.ctx.config.packet_timeout,
            cancel: self.cancel.as_ref(),
        }
        .receive()
        .and_then(|()| block.data());

        let data = match received {
            Ok(data) => data,
            Err(TransferError::Aborted(AbortReason::Cancelled)) => {
                return (RequestStatus::Cancelled, None);
            }
            Err(error) => {
                debug!(uid = %self.uid, peer = %next.id, %error, "Block transfer failed");
                return (RequestStatus::TransferFailed, None);
            }
        };

        match ChkBlock::verify(&key, headers, data) {
            Ok(block) => (RequestStatus::Success, Some(self.found(block.into()))),
            Err(error) => {
                warn!(uid = %self.uid, peer = %next.id, %error, "Received block does not verify");
                (RequestStatus::VerifyFailure, None)
            }
        }
    }

    fn receive_ssk(
        &mut self,
        next: &PeerHandle,
        key: SskKey,
        headers: Bytes,
        known_pubkey: Option<[u8; 32]>,
    ) -> (RequestStatus, Option<Block>) {
        let data = match self.wait(next, SSK_DATA_KINDS, self.ctx.config.packet_timeout) {
            WaitResult::Matched(Message {
                body: MessageBody::SskDataFoundData { data },
                ..
            }) => data,
            WaitResult::Cancelled => return (RequestStatus::Cancelled, None),
            _ => return (RequestStatus::TransferFailed, None),
        };

        let pubkey = match known_pubkey {
            Some(pubkey) => pubkey,
            None => match self.wait(next, SSK_PUBKEY_KINDS, self.ctx.config.accepted_timeout) {
                WaitResult::Matched(Message {
                    body: MessageBody::SskPubKey { pubkey },
                    ..
                }) => {
                    if !self.ctx.pubkeys.put(key.pubkey_hash, pubkey) {
                        warn!(uid = %self.uid, peer = %next.id, "Public key does not match key");
                        return (RequestStatus::VerifyFailure, None);
                    }
                    pubkey
                }
                WaitResult::Cancelled => return (RequestStatus::Cancelled, None),
                _ => return (RequestStatus::TransferFailed, None),
            },
        };

        match SskBlock::verify(&key, &headers, data, &pubkey) {
            Ok(block) => (RequestStatus::Success, Some(self.found(block.into()))),
            Err(error) => {
                warn!(uid = %self.uid, peer = %next.id, %error, "Received block does not verify");
                (RequestStatus::VerifyFailure, None)
            }
        }
    }

    fn found(&self, block: Block) -> Block {
        self.ctx.commit(block.clone());
        block
    }

    fn finish(&mut self, status: RequestStatus, block: Option<Block>) {
        self.terminal.set(status);

        if matches!(
            status,
            RequestStatus::DataNotFound | RequestStatus::RouteNotFound
        ) {
            self.ctx.failure_table.on_final_failure(
                &self.key,
                self.source.as_ref(),
                self.route.htl(),
                self.ctx.config.recently_failed_timeout,
            );
        }

        debug!(uid = %self.uid, key = %self.key, ?status, htl = self.route.htl(), "Request finished");

        let _ = self.events.send(ForwarderEvent::Finished(RequestOutcome {
            status,
            htl: self.route.htl(),
            block,
        }));
    }

    fn wait(&self, next: &PeerHandle, kinds: &'static [MessageKind], timeout: Duration) -> WaitResult {
        self.wait_until(next, kinds, Instant::now() + timeout)
    }

    /// Wait against a deadline that relayed overloads do not push back.
    fn wait_until(
        &self,
        next: &PeerHandle,
        kinds: &'static [MessageKind],
        deadline: Instant,
    ) -> WaitResult {
        self.ctx.dispatcher.wait_until(
            MessageFilter::new(self.uid, next.id, kinds),
            deadline,
            self.cancel.as_ref(),
        )
    }

    fn local_overload(&mut self, next: &PeerHandle) {
        self.ctx.peers.on_local_overload(next.id);
        self.overloaded = true;
    }

    fn relay_overload(&mut self) {
        if !self.relayed_overload {
            self.relayed_overload = true;
            let _ = self.events.send(ForwarderEvent::ForwardedOverload);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}
