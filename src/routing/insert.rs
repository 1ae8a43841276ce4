//! Drives one CHK insert chain and gates its report on downstream transfers.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, error, info, trace, warn};

use crate::common::{
    validate_chk, AbortReason, ChkKey, Htl, Message, MessageBody, MessageKind, PeerHandle, PeerId,
    RejectReason, SskBlock, Uid,
};
use crate::node::NodeContext;
use crate::rpc::{
    cancel_pair, BlockTransmitter, CancelToken, Canceller, Config, MessageFilter, PartialBlock,
    TransferError, WaitResult,
};
use crate::server::{UidKind, UidLock};

use super::{spawn_chain, ForwarderEvent, Hop, PeerSelector, Route, Terminal};

const ACCEPT_KINDS: &[MessageKind] = &[
    MessageKind::Accepted,
    MessageKind::RejectedLoop,
    MessageKind::RejectedOverload,
];
const REPLY_KINDS: &[MessageKind] = &[
    MessageKind::InsertReply,
    MessageKind::RouteNotFound,
    MessageKind::RejectedOverload,
    MessageKind::RejectedTimeout,
    MessageKind::DataInsertRejected,
];
const COMPLETED_KINDS: &[MessageKind] = &[MessageKind::InsertTransfersCompleted];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Terminal status of an insert chain.
pub enum InsertStatus {
    Success,
    RouteNotFound,
    /// No hop was ever sent the insert.
    RouteReallyNotFound,
    TimedOut,
    GeneratedRejectedOverload,
    /// This node's own receive of the payload failed.
    ReceiveFailed,
    InternalError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub status: InsertStatus,
    /// HTL the chain ended with.
    pub htl: Htl,
    /// Some downstream transfer failed or did not settle in time.
    pub any_transfers_failed: bool,
    /// An SSK insert met an older, different block and carried that one instead.
    pub has_collided: bool,
    /// The block an SSK insert ended up carrying.
    pub canonical: Option<SskBlock>,
}

impl InsertOutcome {
    pub(crate) fn internal_error(htl: Htl) -> Self {
        Self {
            status: InsertStatus::InternalError,
            htl,
            any_transfers_failed: false,
            has_collided: false,
            canonical: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct InsertParams {
    pub key: ChkKey,
    pub uid: Uid,
    pub htl: Htl,
    pub source: Option<PeerHandle>,
    pub headers: Bytes,
    pub block: Arc<PartialBlock>,
    pub fork_on_cacheable: bool,
    /// Fires if this node fails to receive the payload from its predecessor.
    pub receive_failed: Option<CancelToken>,
}

#[derive(Debug)]
pub(crate) struct InsertForwarder {
    ctx: Arc<NodeContext>,
    key: ChkKey,
    uid: Uid,
    headers: Bytes,
    block: Arc<PartialBlock>,
    route: Route,
    fork_on_cacheable: bool,
    /// UID this chain continues under after forking.
    forked: Option<UidLock>,
    transfers: TransferAggregator,
    receive_failed: Option<CancelToken>,
    terminal: Terminal<InsertStatus>,
    events: Sender<ForwarderEvent<InsertOutcome>>,
    relayed_overload: bool,
}

impl InsertForwarder {
    pub fn new(
        ctx: Arc<NodeContext>,
        params: InsertParams,
    ) -> (Self, Receiver<ForwarderEvent<InsertOutcome>>) {
        let (events, receiver) = flume::unbounded();
        let target = params.key.routing_key().location();
        let route = Route::new(&ctx, target, params.htl, params.source);

        (
            Self {
                ctx,
                key: params.key,
                uid: params.uid,
                headers: params.headers,
                block: params.block,
                route,
                fork_on_cacheable: params.fork_on_cacheable,
                forked: None,
                transfers: TransferAggregator::new(),
                receive_failed: params.receive_failed,
                terminal: Terminal::new(),
                events,
                relayed_overload: false,
            },
            receiver,
        )
    }

    pub fn spawn(self) {
        let events = self.events.clone();
        spawn_chain(format!("insert-{}", self.uid), events, move || self.run());
    }

    fn run(mut self) {
        let status = self.search();
        self.finish(status);
    }

    fn search(&mut self) -> InsertStatus {
        loop {
            if self.receive_failed() {
                return InsertStatus::ReceiveFailed;
            }
            self.transfers.poll();

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

        let request = MessageBody::InsertRequest {
            htl: self.route.htl(),
            target: self.route.target(),
            key: self.key,
        };
        trace!(%uid, peer = %next.id, htl = self.route.htl(), "Routing insert");
        if let Err(error) = self.ctx.send(next.id, uid, request) {
            debug!(%uid, %error, "Could not send insert");
            return None;
        }
        self.route.mark_forwarded();

        let deadline = Instant::now() + accepted_timeout;
        loop {
            match self.wait_until(next, ACCEPT_KINDS, deadline) {
                WaitResult::Matched(message) => match message.body {
                    MessageBody::Accepted => {
                        self.route.mark_accepted();
                        break;
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
                    debug!(%uid, peer = %next.id, "Timed out waiting for Accepted");
                    self.ctx.peers.on_local_overload(next.id);
                    return None;
                }
                WaitResult::Disconnected => return None,
                WaitResult::Cancelled => return Some(InsertStatus::ReceiveFailed),
            }
        }

        let headers = MessageBody::DataInsert {
            headers: self.headers.clone(),
        };
        if self.ctx.send(next.id, uid, headers).is_err() {
            return None;
        }
        self.transfers.start(&self.ctx, *next, uid, self.block.clone());

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
                        self.transfers.kill(next.id);
                        self.rejected(next, reason);
                        return None;
                    }
                    _ => return None,
                },
                WaitResult::TimedOut => {
                    warn!(%uid, peer = %next.id, "Timed out waiting for insert reply");
                    self.ctx.peers.on_local_overload(next.id);
                    return Some(InsertStatus::GeneratedRejectedOverload);
                }
                WaitResult::Disconnected => return None,
                WaitResult::Cancelled => return Some(InsertStatus::ReceiveFailed),
            }
        }
    }

    fn rejected(&self, next: &PeerHandle, reason: RejectReason) {
        match reason {
            RejectReason::VerifyFailed if self.block.all_received() => {
                let verifies = self
                    .block
                    .data()
                    .is_ok_and(|data| validate_chk(&self.headers, &data, &self.key));

                if verifies {
                    warn!(uid = %self.uid, peer = %next.id, "Hop rejected data that verifies here");
                } else {
                    warn!(uid = %self.uid, peer = %next.id, "Data does not verify, trying next hop");
                }
            }
            reason => debug!(uid = %self.uid, peer = %next.id, %reason, "Insert data rejected"),
        }
    }

    /// Continue as an independent chain under a fresh UID.
    fn fork(&mut self, next: &PeerHandle) {
        let lock = UidLock::random(&self.ctx.uids, UidKind::ChkInsert);

        info!(
            old = %self.uid,
            new = %lock.uid(),
            htl = self.route.htl(),
            "Forking insert, now cacheable"
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

        let any_transfers_failed = self
            .transfers
            .wait_all(self.ctx.peers.as_ref(), &self.ctx.config);
        self.forked.take();

        debug!(
            uid = %self.uid,
            ?status,
            htl = self.route.htl(),
            any_transfers_failed,
            "Insert finished"
        );

        let _ = self.events.send(ForwarderEvent::Finished(InsertOutcome {
            status,
            htl: self.route.htl(),
            any_transfers_failed,
            has_collided: false,
            canonical: None,
        }));
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
            self.receive_failed.as_ref(),
        )
    }

    fn relay_overload(&mut self) {
        if !self.relayed_overload {
            self.relayed_overload = true;
            let _ = self.events.send(ForwarderEvent::ForwardedOverload);
        }
    }

    fn receive_failed(&self) -> bool {
        self.receive_failed
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
/// What is known about the payload handed to one downstream hop.
pub struct DownstreamCompletion {
    pub transfer_done: bool,
    pub transfer_succeeded: bool,
    /// The hop reported its own downstream transfers as completed.
    pub notified_done: bool,
    pub notified_succeeded: bool,
}

impl DownstreamCompletion {
    pub fn is_settled(&self) -> bool {
        self.transfer_done && self.notified_done
    }

    pub fn is_failed(&self) -> bool {
        self.is_settled() && !(self.transfer_succeeded && self.notified_succeeded)
    }
}

#[derive(Debug)]
enum TransferNotice {
    Transmitted { peer: PeerId, succeeded: bool },
    Completed { peer: PeerId, any_timed_out: bool },
    Disconnected { peer: PeerId },
}

#[derive(Debug)]
struct BackgroundTransfer {
    peer: PeerHandle,
    completion: DownstreamCompletion,
    /// The hop rejected the payload, its transfer no longer matters.
    killed: bool,
    disconnected: bool,
    canceller: Canceller,
}

impl BackgroundTransfer {
    fn is_pending(&self, peers: &dyn PeerSelector) -> bool {
        !self.killed
            && !self.disconnected
            && !self.completion.is_settled()
            && peers.is_connected(&self.peer)
    }

    fn is_failed(&self) -> bool {
        !self.killed && !self.disconnected && self.completion.is_failed()
    }
}

#[derive(Debug)]
/// Background transmissions of one insert, one per hop that accepted it.
pub(crate) struct TransferAggregator {
    transfers: Vec<BackgroundTransfer>,
    sender: Sender<TransferNotice>,
    notices: Receiver<TransferNotice>,
}

impl TransferAggregator {
    pub fn new() -> Self {
        let (sender, notices) = flume::unbounded();

        Self {
            transfers: Vec::new(),
            sender,
            notices,
        }
    }

    /// Start streaming `block` to `peer` and waiting for its completion notice.
    pub fn start(
        &mut self,
        ctx: &Arc<NodeContext>,
        peer: PeerHandle,
        uid: Uid,
        block: Arc<PartialBlock>,
    ) {
        let (canceller, token) = cancel_pair();
        let mut completion = DownstreamCompletion::default();

        let worker = ctx.clone();
        let notices = self.sender.clone();
        let spawned = thread::Builder::new()
            .name(format!("insert-transfer-{}", uid))
            .spawn(move || transfer(&worker, peer, uid, &block, &token, &notices));

        if let Err(error) = spawned {
            error!(%uid, peer = %peer.id, ?error, "Could not spawn transfer thread");
            completion.transfer_done = true;
            completion.notified_done = true;
        }

        self.transfers.push(BackgroundTransfer {
            peer,
            completion,
            killed: false,
            disconnected: false,
            canceller,
        });
    }

    /// Stop the transfer to a hop that rejected the payload.
    pub fn kill(&mut self, peer: PeerId) {
        for transfer in self.transfers.iter_mut().filter(|t| t.peer.id == peer) {
            if !transfer.completion.is_settled() {
                transfer.killed = true;
                transfer.canceller.cancel();
            }
        }
    }

    /// Apply every notice received so far.
    pub fn poll(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            self.apply(notice);
        }
    }

    /// Wait for every connected hop to settle, returns whether any transfer failed.
    ///
    /// Waiting is bounded by the transfer completion timeout, counted from now.
    pub fn wait_all(&mut self, peers: &dyn PeerSelector, config: &Config) -> bool {
        if self.transfers.is_empty() {
            return false;
        }

        let deadline = Instant::now() + config.transfer_completion_timeout;
        let mut timed_out = false;

        loop {
            self.poll();
            if !self.transfers.iter().any(|t| t.is_pending(peers)) {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    pending = self.transfers.iter().filter(|t| t.is_pending(peers)).count(),
                    "Timed out waiting for downstream transfers"
                );
                timed_out = true;
                break;
            }

            let slice = config.completion_poll_interval.min(deadline - now);
            if let Ok(notice) = self.notices.recv_timeout(slice) {
                self.apply(notice);
            }
        }

        for transfer in &self.transfers {
            transfer.canceller.cancel();
        }

        timed_out || self.transfers.iter().any(BackgroundTransfer::is_failed)
    }

    fn apply(&mut self, notice: TransferNotice) {
        match notice {
            TransferNotice::Transmitted { peer, succeeded } => {
                for transfer in self.unsettled(peer) {
                    transfer.completion.transfer_done = true;
                    transfer.completion.transfer_succeeded = succeeded;
                    if !succeeded {
                        // No completion notice will follow a failed transmission.
                        transfer.completion.notified_done = true;
                    }
                }
            }
            TransferNotice::Completed {
                peer,
                any_timed_out,
            } => {
                for transfer in self.unsettled(peer) {
                    transfer.completion.notified_done = true;
                    transfer.completion.notified_succeeded = !any_timed_out;
                }
            }
            TransferNotice::Disconnected { peer } => {
                for transfer in self.unsettled(peer) {
                    transfer.disconnected = true;
                }
            }
        }
    }

    fn unsettled(&mut self, peer: PeerId) -> impl Iterator<Item = &mut BackgroundTransfer> {
        self.transfers
            .iter_mut()
            .filter(move |t| t.peer.id == peer && !t.completion.is_settled())
    }
}

/// Body of a background transfer thread.
fn transfer(
    ctx: &NodeContext,
    peer: PeerHandle,
    uid: Uid,
    block: &PartialBlock,
    cancel: &CancelToken,
    notices: &Sender<TransferNotice>,
) {
    let completed = ctx
        .dispatcher
        .subscribe(MessageFilter::new(uid, peer.id, COMPLETED_KINDS));

    let sent = BlockTransmitter {
        transport: ctx.transport.as_ref(),
        to: peer.id,
        uid,
        block,
        packet_timeout: ctx.config.packet_timeout,
        cancel: Some(cancel),
    }
    .send();

    let peer_id = peer.id;
    match sent {
        Ok(()) => {
            let _ = notices.send(TransferNotice::Transmitted {
                peer: peer_id,
                succeeded: true,
            });
        }
        Err(TransferError::NotConnected(_)) => {
            let _ = notices.send(TransferNotice::Disconnected { peer: peer_id });
            return;
        }
        Err(TransferError::Aborted(AbortReason::Cancelled)) => return,
        Err(error) => {
            debug!(%uid, peer = %peer_id, %error, "Downstream transfer failed");
            let _ = notices.send(TransferNotice::Transmitted {
                peer: peer_id,
                succeeded: false,
            });
            return;
        }
    }

    let timeout = ctx.config.search_timeout + ctx.config.transfer_completion_timeout;
    let notice = match completed.recv(timeout, Some(cancel)) {
        WaitResult::Matched(Message {
            body: MessageBody::InsertTransfersCompleted { any_timed_out },
            ..
        }) => TransferNotice::Completed {
            peer: peer_id,
            any_timed_out,
        },
        WaitResult::Matched(_) | WaitResult::Cancelled => return,
        WaitResult::TimedOut => TransferNotice::Completed {
            peer: peer_id,
            any_timed_out: true,
        },
        WaitResult::Disconnected => TransferNotice::Disconnected { peer: peer_id },
    };

    let _ = notices.send(notice);
}
