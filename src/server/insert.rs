//! Receiving side of a CHK insert.
//!
//! The local commit, if any, happens only once the local receive is resolved and the
//! downstream chain has reported, with all of its transfers settled. The upstream
//! completion notice is sent only after the commit decision.

use std::sync::Arc;
use std::thread;

use tracing::{debug, error, warn};

use crate::common::{
    AbortReason, ChkBlock, ChkKey, Htl, Message, MessageBody, MessageKind, PeerHandle,
    RejectReason, Uid,
};
use crate::node::NodeContext;
use crate::routing::{ForwarderEvent, InsertForwarder, InsertOutcome, InsertParams, InsertStatus};
use crate::rpc::{
    cancel_pair, BlockReceiver, MessageFilter, PartialBlock, TransferError, WaitResult,
};

use super::UidLock;

const DATA_INSERT_KINDS: &[MessageKind] = &[MessageKind::DataInsert];

#[derive(Debug)]
pub(crate) struct InsertHandler {
    ctx: Arc<NodeContext>,
    source: PeerHandle,
    uid: Uid,
    key: ChkKey,
    htl: Htl,
    _lock: UidLock,
}

impl InsertHandler {
    pub fn new(
        ctx: Arc<NodeContext>,
        source: PeerHandle,
        key: ChkKey,
        htl: Htl,
        lock: UidLock,
    ) -> Self {
        Self {
            ctx,
            source,
            uid: lock.uid(),
            key,
            htl,
            _lock: lock,
        }
    }

    pub fn run(self) {
        let ctx = &self.ctx;
        self.reply(MessageBody::Accepted);

        let headers = match ctx.dispatcher.wait_for(
            MessageFilter::new(self.uid, self.source.id, DATA_INSERT_KINDS),
            ctx.config.data_insert_timeout,
            None,
        ) {
            WaitResult::Matched(Message {
                body: MessageBody::DataInsert { headers },
                ..
            }) => headers,
            WaitResult::Matched(_) | WaitResult::TimedOut => {
                debug!(uid = %self.uid, "Timed out waiting for DataInsert");
                self.reply(MessageBody::RejectedTimeout);
                self.reply(MessageBody::InsertTransfersCompleted {
                    any_timed_out: true,
                });
                return;
            }
            WaitResult::Disconnected | WaitResult::Cancelled => return,
        };

        let block = Arc::new(PartialBlock::new(ctx.config.block));
        let (receive_canceller, receive_failed) = cancel_pair();
        let (done, receive_done) = flume::bounded::<Result<(), TransferError>>(1);

        let spawned = {
            let ctx = ctx.clone();
            let block = block.clone();
            let canceller = receive_canceller.clone();
            let (source, uid) = (self.source.id, self.uid);

            thread::Builder::new()
                .name(format!("insert-receive-{}", uid))
                .spawn(move || {
                    let received = BlockReceiver {
                        dispatcher: &ctx.dispatcher,
                        from: source,
                        uid,
                        block: &block,
                        packet_timeout: ctx.config.packet_timeout,
                        cancel: None,
                    }
                    .receive();

                    if received.is_err() {
                        canceller.cancel();
                        ctx.reply(
                            source,
                            uid,
                            MessageBody::DataInsertRejected {
                                reason: RejectReason::ReceiveFailed,
                            },
                        );
                    }
                    let _ = done.send(received);
                })
        };
        if let Err(error) = spawned {
            error!(uid = %self.uid, ?error, "Could not spawn receive thread");
            block.abort(AbortReason::Cancelled);
            self.reply(MessageBody::RejectedOverload { local: true });
            return;
        }

        let (can_commit, any_timed_out) = if self.htl == 0 {
            self.reply(MessageBody::InsertReply);
            (true, false)
        } else {
            let (forwarder, events) = InsertForwarder::new(
                ctx.clone(),
                InsertParams {
                    key: self.key,
                    uid: self.uid,
                    htl: self.htl,
                    source: Some(self.source),
                    headers: headers.clone(),
                    block: block.clone(),
                    fork_on_cacheable: ctx.config.fork_on_cacheable,
                    receive_failed: Some(receive_failed),
                },
            );
            forwarder.spawn();

            let mut relayed_overload = false;
            let outcome = loop {
                match events.recv() {
                    Ok(ForwarderEvent::ForwardedOverload) => {
                        if !relayed_overload {
                            relayed_overload = true;
                            self.reply(MessageBody::RejectedOverload { local: false });
                        }
                    }
                    Ok(ForwarderEvent::Finished(outcome)) => break Some(outcome),
                    Ok(ForwarderEvent::Collided(_)) => {}
                    // A failed receive cancels the forwarder, which then finishes.
                    Ok(ForwarderEvent::Crashed) | Err(_) => break None,
                }
            };

            self.relay(outcome)
        };

        let received = receive_done
            .recv()
            .unwrap_or(Err(TransferError::Incomplete))
            .and_then(|()| block.data());
        drop(receive_canceller);

        match received {
            Ok(data) => match ChkBlock::verify(&self.key, headers, data) {
                Ok(block) => {
                    if can_commit && ctx.config.htl_policy().can_write_datastore(self.htl) {
                        ctx.commit(block.into());
                    }
                }
                Err(error) => {
                    warn!(
                        uid = %self.uid,
                        peer = %self.source.id,
                        %error,
                        "Inserted data does not verify"
                    );
                    self.reply(MessageBody::DataInsertRejected {
                        reason: RejectReason::VerifyFailed,
                    });
                }
            },
            Err(error) => debug!(uid = %self.uid, %error, "Insert payload not received"),
        }

        self.reply(MessageBody::InsertTransfersCompleted { any_timed_out });
    }

    /// Relay the forwarder's terminal status, returns whether a commit is allowed and
    /// whether anything downstream failed.
    fn relay(&self, outcome: Option<InsertOutcome>) -> (bool, bool) {
        let Some(outcome) = outcome else {
            self.reply(MessageBody::RejectedOverload { local: true });
            return (false, false);
        };
        let any_failed = outcome.any_transfers_failed;

        match outcome.status {
            InsertStatus::Success => {
                self.reply(MessageBody::InsertReply);
                (true, any_failed)
            }
            InsertStatus::RouteNotFound | InsertStatus::RouteReallyNotFound => {
                self.reply(MessageBody::RouteNotFound { htl: outcome.htl });
                (true, any_failed)
            }
            InsertStatus::TimedOut | InsertStatus::GeneratedRejectedOverload => {
                self.reply(MessageBody::RejectedOverload { local: true });
                (true, any_failed)
            }
            InsertStatus::InternalError => {
                self.reply(MessageBody::RejectedOverload { local: true });
                (false, any_failed)
            }
            // Already rejected by the receive thread.
            InsertStatus::ReceiveFailed => (false, any_failed),
        }
    }

    fn reply(&self, body: MessageBody) {
        self.ctx.reply(self.source.id, self.uid, body);
    }
}
