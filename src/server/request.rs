//! Answers an inbound GET.

use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::common::{Block, Htl, Key, MessageBody, PeerHandle, Uid};
use crate::node::NodeContext;
use crate::routing::{ForwarderEvent, RequestForwarder, RequestOutcome, RequestStatus};
use crate::rpc::{cancel_pair, BlockTransmitter, PartialBlock};

use super::UidLock;

#[derive(Debug)]
pub(crate) struct RequestHandler {
    ctx: Arc<NodeContext>,
    source: PeerHandle,
    uid: Uid,
    key: Key,
    htl: Htl,
    need_pub_key: bool,
    _lock: UidLock,
}

impl RequestHandler {
    pub fn new(
        ctx: Arc<NodeContext>,
        source: PeerHandle,
        key: Key,
        htl: Htl,
        need_pub_key: bool,
        lock: UidLock,
    ) -> Self {
        Self {
            ctx,
            source,
            uid: lock.uid(),
            key,
            htl,
            need_pub_key,
            _lock: lock,
        }
    }

    pub fn run(self) {
        self.reply(MessageBody::Accepted);

        if let Some(block) = self.ctx.store.fetch(&self.key) {
            trace!(uid = %self.uid, key = %self.key, "Serving request from the local store");
            self.send_block(&block);
            return;
        }

        let (canceller, cancel) = cancel_pair();
        let watch = self
            .ctx
            .dispatcher
            .cancel_on_disconnect(self.source.id, canceller.clone());

        let (forwarder, events) = RequestForwarder::new(
            self.ctx.clone(),
            self.key,
            self.uid,
            self.htl,
            Some(self.source),
            Some(cancel),
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
                Ok(ForwarderEvent::Crashed) | Err(_) => break None,
            }
        };

        self.ctx.dispatcher.forget_disconnect(watch);
        drop(canceller);

        match outcome {
            Some(RequestOutcome {
                status: RequestStatus::Success,
                block: Some(block),
                ..
            }) => self.send_block(&block),
            Some(RequestOutcome {
                status: RequestStatus::DataNotFound | RequestStatus::RecentlyFailed,
                ..
            }) => self.reply(MessageBody::DataNotFound),
            Some(RequestOutcome {
                status: RequestStatus::RouteNotFound,
                htl,
                ..
            }) => self.reply(MessageBody::RouteNotFound { htl }),
            Some(RequestOutcome {
                status: RequestStatus::Cancelled,
                ..
            }) => debug!(uid = %self.uid, "Request cancelled, predecessor is gone"),
            _ => self.reply(MessageBody::RejectedOverload { local: true }),
        }
    }

    fn send_block(&self, block: &Block) {
        match block {
            Block::Chk(block) => {
                self.reply(MessageBody::DataFound {
                    headers: block.headers().clone(),
                });

                let payload = match PartialBlock::complete(self.ctx.config.block, block.data()) {
                    Ok(payload) => payload,
                    Err(error) => {
                        error!(uid = %self.uid, %error, "Stored block does not fit the block geometry");
                        return;
                    }
                };

                let sent = BlockTransmitter {
                    transport: self.ctx.transport.as_ref(),
                    to: self.source.id,
                    uid: self.uid,
                    block: &payload,
                    packet_timeout: self.ctx.config.packet_timeout,
                    cancel: None,
                }
                .send();

                if let Err(error) = sent {
                    debug!(uid = %self.uid, %error, "Could not send block upstream");
                }
            }
            Block::Ssk(block) => {
                self.reply(MessageBody::SskDataFoundHeaders {
                    headers: block.headers(),
                });
                self.reply(MessageBody::SskDataFoundData {
                    data: block.data().clone(),
                });
                if self.need_pub_key {
                    self.reply(MessageBody::SskPubKey {
                        pubkey: *block.pubkey(),
                    });
                }
            }
        }
    }

    fn reply(&self, body: MessageBody) {
        self.ctx.reply(self.source.id, self.uid, body);
    }
}
