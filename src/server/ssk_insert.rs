//! Receiving side of an SSK insert.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::common::{
    Block, Htl, Key, Message, MessageBody, MessageKind, PeerHandle, RejectReason, SskBlock,
    SskKey, Uid,
};
use crate::node::NodeContext;
use crate::routing::{
    ForwarderEvent, InsertOutcome, InsertStatus, SskInsertForwarder, SskInsertParams,
};
use crate::rpc::{MessageFilter, WaitResult};

use super::UidLock;

const HEADERS_KINDS: &[MessageKind] = &[MessageKind::SskInsertRequestHeaders];
const DATA_KINDS: &[MessageKind] = &[MessageKind::SskInsertRequestData];
const PUBKEY_KINDS: &[MessageKind] = &[MessageKind::SskPubKey];

#[derive(Debug)]
pub(crate) struct SskInsertHandler {
    ctx: Arc<NodeContext>,
    source: PeerHandle,
    uid: Uid,
    key: SskKey,
    htl: Htl,
    _lock: UidLock,
}

impl SskInsertHandler {
    pub fn new(
        ctx: Arc<NodeContext>,
        source: PeerHandle,
        key: SskKey,
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
        let Some(mut block) = self.receive() else {
            return;
        };

        if let Some(Block::Ssk(existing)) = self.ctx.store.fetch(&Key::Ssk(self.key)) {
            if existing != block {
                info!(uid = %self.uid, "SSK insert collides with the stored block");
                self.send_collision(&existing);
                block = existing;
            }
        }

        if self.htl == 0 {
            self.commit(true, block);
            self.reply(MessageBody::InsertReply);
        } else {
            self.forward(block);
        }
    }

    /// Accept the insert and receive headers, data and, if needed, the public key.
    fn receive(&self) -> Option<SskBlock> {
        let config = &self.ctx.config;
        let known_pubkey = self.ctx.pubkeys.get(&self.key.pubkey_hash);

        self.reply(MessageBody::SskAccepted {
            need_pub_key: known_pubkey.is_none(),
        });

        let headers = match self.wait(HEADERS_KINDS, config.data_insert_timeout) {
            Some(MessageBody::SskInsertRequestHeaders { headers }) => headers,
            _ => return self.timed_out(),
        };
        let data = match self.wait(DATA_KINDS, config.data_insert_timeout) {
            Some(MessageBody::SskInsertRequestData { data }) => data,
            _ => return self.timed_out(),
        };

        let pubkey = match known_pubkey {
            Some(pubkey) => pubkey,
            None => match self.wait(PUBKEY_KINDS, config.accepted_timeout) {
                Some(MessageBody::SskPubKey { pubkey }) => {
                    if !self.ctx.pubkeys.put(self.key.pubkey_hash, pubkey) {
                        warn!(uid = %self.uid, "Public key does not match key");
                        return self.rejected();
                    }
                    self.reply(MessageBody::SskPubKeyAccepted);
                    pubkey
                }
                _ => return self.timed_out(),
            },
        };

        self.verify(headers, data, &pubkey)
    }

    fn verify(&self, headers: Bytes, data: Bytes, pubkey: &[u8; 32]) -> Option<SskBlock> {
        match SskBlock::verify(&self.key, &headers, data, pubkey) {
            Ok(block) => Some(block),
            Err(error) => {
                warn!(
                    uid = %self.uid,
                    peer = %self.source.id,
                    %error,
                    "Inserted block does not verify"
                );
                self.rejected()
            }
        }
    }

    /// Run the chain further, relaying collisions and the terminal status upstream.
    fn forward(&self, mut block: SskBlock) {
        let (forwarder, events) = SskInsertForwarder::new(
            self.ctx.clone(),
            SskInsertParams {
                block: block.clone(),
                uid: self.uid,
                htl: self.htl,
                source: Some(self.source),
                fork_on_cacheable: self.ctx.config.fork_on_cacheable,
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
                Ok(ForwarderEvent::Collided(existing)) => {
                    if existing != block {
                        self.send_collision(&existing);
                        block = existing;
                    }
                }
                Ok(ForwarderEvent::Finished(outcome)) => break Some(outcome),
                Ok(ForwarderEvent::Crashed) | Err(_) => break None,
            }
        };

        let (can_commit, reply) = match outcome {
            Some(InsertOutcome { status, htl, .. }) => match status {
                InsertStatus::Success => (true, MessageBody::InsertReply),
                InsertStatus::RouteNotFound | InsertStatus::RouteReallyNotFound => {
                    (true, MessageBody::RouteNotFound { htl })
                }
                InsertStatus::TimedOut | InsertStatus::GeneratedRejectedOverload => {
                    (true, MessageBody::RejectedOverload { local: true })
                }
                InsertStatus::ReceiveFailed | InsertStatus::InternalError => {
                    (false, MessageBody::RejectedOverload { local: true })
                }
            },
            None => (false, MessageBody::RejectedOverload { local: true }),
        };

        // The commit decision precedes the terminal reply.
        self.commit(can_commit, block);
        self.reply(reply);
    }

    fn commit(&self, can_commit: bool, block: SskBlock) {
        if can_commit && self.ctx.config.htl_policy().can_write_datastore(self.htl) {
            self.ctx.commit(block.into());
        } else {
            debug!(uid = %self.uid, htl = self.htl, "Not caching SSK insert");
        }
    }

    fn send_collision(&self, existing: &SskBlock) {
        self.reply(MessageBody::SskDataFoundHeaders {
            headers: existing.headers(),
        });
        self.reply(MessageBody::SskDataFoundData {
            data: existing.data().clone(),
        });
    }

    fn wait(&self, kinds: &'static [MessageKind], timeout: Duration) -> Option<MessageBody> {
        match self.ctx.dispatcher.wait_for(
            MessageFilter::new(self.uid, self.source.id, kinds),
            timeout,
            None,
        ) {
            WaitResult::Matched(Message { body, .. }) => Some(body),
            _ => None,
        }
    }

    fn timed_out(&self) -> Option<SskBlock> {
        debug!(uid = %self.uid, "Timed out receiving SSK insert");
        self.reply(MessageBody::RejectedTimeout);
        None
    }

    fn rejected(&self) -> Option<SskBlock> {
        self.reply(MessageBody::DataInsertRejected {
            reason: RejectReason::VerifyFailed,
        });
        None
    }

    fn reply(&self, body: MessageBody) {
        self.ctx.reply(self.source.id, self.uid, body);
    }
}
