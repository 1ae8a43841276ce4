//! A routing node: local origination of requests and inserts, and admission of
//! the chains neighbours start on it.

use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::common::{
    Block, ChkBlock, Htl, HtlCoins, Key, Location, Message, MessageBody, PeerId, SskBlock, Uid,
};
use crate::routing::{
    await_finished, InsertForwarder, InsertOutcome, InsertParams, InsertStatus, PeerSelector,
    RequestForwarder, RequestOutcome, RequestStatus, SskInsertForwarder, SskInsertParams,
};
use crate::rpc::{Config, Dispatcher, NotConnected, PartialBlock, Transport};
use crate::server::{
    spawn_handler, BlockStore, FailureTable, InsertHandler, LruStore, PubKeyCache,
    RecentFailures, RequestHandler, SskInsertHandler, UidKind, UidLock, UidRegistry, UidTracker,
};
use crate::{Error, Result};

#[derive(Debug)]
/// Everything a chain running on this node shares.
pub(crate) struct NodeContext {
    pub config: Config,
    pub location: Location,
    /// Boundary coins for chains originated here.
    pub coins: HtlCoins,
    pub peers: Arc<dyn PeerSelector>,
    pub transport: Arc<dyn Transport>,
    pub dispatcher: Arc<Dispatcher>,
    pub uids: Arc<dyn UidRegistry>,
    pub failure_table: Arc<dyn FailureTable>,
    pub store: Arc<dyn BlockStore>,
    pub pubkeys: PubKeyCache,
}

impl NodeContext {
    pub fn send(&self, to: PeerId, uid: Uid, body: MessageBody) -> Result<(), NotConnected> {
        self.transport.send(to, Message::new(uid, body))
    }

    /// Send a message whose loss only matters to the peer, such as a reply upstream.
    pub fn reply(&self, to: PeerId, uid: Uid, body: MessageBody) {
        let kind = body.kind();
        if let Err(error) = self.send(to, uid, body) {
            debug!(%uid, ?kind, %error, "Could not reply");
        }
    }

    /// Commit a verified block to the local store.
    pub fn commit(&self, block: Block) {
        info!(key = %block.key(), "Storing block");

        self.failure_table.on_found(&block);
        self.store.put(block);
    }

    fn is_overloaded(&self) -> bool {
        self.uids.running() >= self.config.max_running_chains
    }

    pub fn handle_message(self: &Arc<Self>, from: PeerId, message: Message) {
        if !message.is_request() {
            if !self.dispatcher.deliver(from, message) {
                trace!(%from, "Nobody waits for this message yet");
            }
            return;
        }

        let uid = message.uid;
        let Some(source) = self.peers.handle(from) else {
            debug!(%uid, %from, "Dropping request from unknown peer");
            return;
        };

        if self.is_overloaded() {
            debug!(%uid, %from, "Too many running chains");
            self.reply(from, uid, MessageBody::RejectedOverload { local: true });
            return;
        }

        let kind = match &message.body {
            MessageBody::ChkDataRequest { .. } => UidKind::ChkRequest,
            MessageBody::SskDataRequest { .. } => UidKind::SskRequest,
            MessageBody::InsertRequest { .. } => UidKind::ChkInsert,
            _ => UidKind::SskInsert,
        };
        let Some(lock) = UidLock::acquire(&self.uids, uid, kind) else {
            debug!(%uid, %from, "Rejecting loop");
            self.reply(from, uid, MessageBody::RejectedLoop);
            return;
        };

        let ctx = self.clone();
        match message.body {
            MessageBody::ChkDataRequest { htl, key, .. } => {
                spawn_handler(format!("chk-request-{}", uid), move || {
                    RequestHandler::new(ctx, source, key.into(), htl, false, lock).run()
                })
            }
            MessageBody::SskDataRequest {
                htl,
                key,
                need_pub_key,
                ..
            } => spawn_handler(format!("ssk-request-{}", uid), move || {
                RequestHandler::new(ctx, source, key.into(), htl, need_pub_key, lock).run()
            }),
            MessageBody::InsertRequest { htl, key, .. } => {
                spawn_handler(format!("chk-insert-{}", uid), move || {
                    InsertHandler::new(ctx, source, key, htl, lock).run()
                })
            }
            MessageBody::SskInsertRequest { htl, key, .. } => {
                spawn_handler(format!("ssk-insert-{}", uid), move || {
                    SskInsertHandler::new(ctx, source, key, htl, lock).run()
                })
            }
            _ => {}
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetError {
    #[error("Node is overloaded")]
    /// Too many chains are running on this node, try again later.
    Overloaded,

    #[error("Request failed: {0:?}")]
    Failed(RequestStatus),
}

#[derive(thiserror::Error, Debug)]
pub enum PutError {
    #[error(transparent)]
    /// The block does not fit the configured block geometry.
    InvalidBlock(#[from] Error),

    #[error("Node is overloaded")]
    /// Too many chains are running on this node, try again later.
    Overloaded,
}

#[derive(Debug, Clone, Copy, Default)]
/// Per insert overrides of the node [Config].
pub struct PutOptions {
    /// Initial HTL, clamped to `max_htl`.
    pub htl: Option<Htl>,
    pub fork_on_cacheable: Option<bool>,
}

#[derive(Debug, Clone)]
/// A routing node.
///
/// Inbound messages are handed over with [Node::handle_message], outbound ones leave
/// through the [Transport] given to the [NodeBuilder].
pub struct Node(Arc<NodeContext>);

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    // === Getters ===

    pub fn location(&self) -> Location {
        self.0.location
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Look a block up in the local store only.
    pub fn fetch_local(&self, key: &Key) -> Option<Block> {
        self.0.store.fetch(key)
    }

    pub(crate) fn context(&self) -> &Arc<NodeContext> {
        &self.0
    }

    // === Public Methods ===

    /// Process a message received from a connected peer.
    ///
    /// New requests run on their own thread, so this never blocks on routing.
    pub fn handle_message(&self, from: PeerId, message: Message) {
        self.0.handle_message(from, message)
    }

    /// Wake every chain waiting on `peer`.
    ///
    /// The [PeerSelector] is told separately by whoever owns it.
    pub fn peer_disconnected(&self, peer: PeerId) {
        self.0.dispatcher.peer_disconnected(peer)
    }

    /// Fetch a block, from the local store or the network.
    pub fn get(&self, key: &Key) -> Result<Block, GetError> {
        let ctx = &self.0;

        if let Some(block) = ctx.store.fetch(key) {
            return Ok(block);
        }
        if ctx.is_overloaded() {
            return Err(GetError::Overloaded);
        }

        let kind = if key.is_ssk() {
            UidKind::SskRequest
        } else {
            UidKind::ChkRequest
        };
        let lock = UidLock::random(&ctx.uids, kind);

        let (forwarder, events) =
            RequestForwarder::new(ctx.clone(), *key, lock.uid(), ctx.config.max_htl, None, None);
        forwarder.spawn();

        match await_finished(&events) {
            Some(RequestOutcome {
                status: RequestStatus::Success,
                block: Some(block),
                ..
            }) => Ok(block),
            Some(outcome) => Err(GetError::Failed(outcome.status)),
            None => Err(GetError::Failed(RequestStatus::InternalError)),
        }
    }

    /// Insert a content hash keyed block.
    ///
    /// Returns once the chain is terminal and its transfers settled.
    pub fn put_chk(&self, block: ChkBlock, options: PutOptions) -> Result<InsertOutcome, PutError> {
        let ctx = &self.0;
        let payload = Arc::new(PartialBlock::complete(ctx.config.block, block.data())?);

        if ctx.is_overloaded() {
            return Err(PutError::Overloaded);
        }

        let htl = self.initial_htl(&options);
        let lock = UidLock::random(&ctx.uids, UidKind::ChkInsert);

        let (forwarder, events) = InsertForwarder::new(
            ctx.clone(),
            InsertParams {
                key: *block.key(),
                uid: lock.uid(),
                htl,
                source: None,
                headers: block.headers().clone(),
                block: payload,
                fork_on_cacheable: options
                    .fork_on_cacheable
                    .unwrap_or(ctx.config.fork_on_cacheable),
                receive_failed: None,
            },
        );
        forwarder.spawn();

        let outcome = await_finished(&events).unwrap_or_else(|| InsertOutcome::internal_error(htl));
        drop(lock);

        if allows_commit(outcome.status) && ctx.config.htl_policy().can_write_datastore(htl) {
            ctx.commit(block.into());
        }

        Ok(outcome)
    }

    /// Insert a signed block under its subspace key.
    ///
    /// If the key already holds a different block, here or anywhere along the chain,
    /// that block wins: it is reported as [InsertOutcome::canonical] with
    /// [InsertOutcome::has_collided] set.
    pub fn put_ssk(&self, block: SskBlock, options: PutOptions) -> Result<InsertOutcome, PutError> {
        let ctx = &self.0;

        if ctx.is_overloaded() {
            return Err(PutError::Overloaded);
        }

        let mut block = block;
        let mut collided_locally = false;
        if let Some(Block::Ssk(existing)) = ctx.store.fetch(&Key::Ssk(*block.key())) {
            if existing != block {
                debug!(key = %Key::Ssk(*block.key()), "Local store already holds this key");
                collided_locally = true;
                block = existing;
            }
        }
        ctx.pubkeys.put(block.key().pubkey_hash, *block.pubkey());

        let htl = self.initial_htl(&options);
        let lock = UidLock::random(&ctx.uids, UidKind::SskInsert);

        let (forwarder, events) = SskInsertForwarder::new(
            ctx.clone(),
            SskInsertParams {
                block: block.clone(),
                uid: lock.uid(),
                htl,
                source: None,
                fork_on_cacheable: options
                    .fork_on_cacheable
                    .unwrap_or(ctx.config.fork_on_cacheable),
            },
        );
        forwarder.spawn();

        let mut outcome =
            await_finished(&events).unwrap_or_else(|| InsertOutcome::internal_error(htl));
        drop(lock);

        outcome.has_collided |= collided_locally;
        let canonical = outcome.canonical.get_or_insert(block).clone();

        if allows_commit(outcome.status) && ctx.config.htl_policy().can_write_datastore(htl) {
            ctx.commit(canonical.into());
        }

        Ok(outcome)
    }

    // === Private Methods ===

    fn initial_htl(&self, options: &PutOptions) -> Htl {
        let config = &self.0.config;
        config
            .htl_policy()
            .clamp(options.htl.unwrap_or(config.max_htl))
    }
}

/// Whether a terminal insert status still lets this node cache the block.
fn allows_commit(status: InsertStatus) -> bool {
    !matches!(
        status,
        InsertStatus::ReceiveFailed | InsertStatus::InternalError
    )
}

macro_rules! required_or_error {
    ($self:ident, $builder_field:ident) => {
        match $self.$builder_field {
            None => {
                return Err(Error::BuilderMissingFieldError(stringify!($builder_field)));
            }
            Some($builder_field) => $builder_field,
        }
    };
}

#[derive(Debug, Default)]
/// Builds a [Node] from its collaborators.
///
/// Only the [Transport] and the [PeerSelector] are required, everything else has an
/// in-memory default sized by the [Config].
pub struct NodeBuilder {
    config: Config,
    location: Option<Location>,
    coins: Option<HtlCoins>,
    transport: Option<Arc<dyn Transport>>,
    peers: Option<Arc<dyn PeerSelector>>,
    uid_registry: Option<Arc<dyn UidRegistry>>,
    failure_table: Option<Arc<dyn FailureTable>>,
    store: Option<Arc<dyn BlockStore>>,
}

impl NodeBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Ring position of this node, random by default.
    pub fn location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Boundary coins for chains originated here, rolled at build time by default.
    pub fn coins(mut self, coins: HtlCoins) -> Self {
        self.coins = Some(coins);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn peers(mut self, peers: Arc<dyn PeerSelector>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn uid_registry(mut self, uid_registry: Arc<dyn UidRegistry>) -> Self {
        self.uid_registry = Some(uid_registry);
        self
    }

    pub fn failure_table(mut self, failure_table: Arc<dyn FailureTable>) -> Self {
        self.failure_table = Some(failure_table);
        self
    }

    pub fn store(mut self, store: Arc<dyn BlockStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Node> {
        let transport = required_or_error!(self, transport);
        let peers = required_or_error!(self, peers);
        let config = self.config;

        let location = self.location.unwrap_or_else(Location::random);
        debug!(%location, "Building node");

        Ok(Node(Arc::new(NodeContext {
            location,
            coins: self.coins.unwrap_or_else(HtlCoins::random),
            peers,
            transport,
            dispatcher: Arc::new(Dispatcher::new()),
            uids: self
                .uid_registry
                .unwrap_or_else(|| Arc::new(UidTracker::new())),
            failure_table: self
                .failure_table
                .unwrap_or_else(|| Arc::new(RecentFailures::new(crate::server::MAX_FAILED_KEYS))),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(LruStore::new(config.store_capacity))),
            pubkeys: PubKeyCache::new(config.pubkey_cache_capacity),
            config,
        })))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::HashSet;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, OnceLock, Weak};
    use std::thread;
    use std::time::{Duration, Instant};

    use bytes::Bytes;
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::common::{MessageKind, PeerHandle, RejectReason};
    use crate::routing::PeerTable;
    use crate::rpc::BlockGeometry;

    type Responder = Box<dyn Fn(PeerId, &Message) -> Vec<MessageBody> + Send + Sync>;

    #[derive(Default)]
    /// Answers every message sent by the node under test from a script.
    pub(crate) struct ScriptedTransport {
        node: OnceLock<Weak<NodeContext>>,
        responder: Mutex<Option<Responder>>,
        sent: Mutex<Vec<(PeerId, Message, Instant)>>,
    }

    impl fmt::Debug for ScriptedTransport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ScriptedTransport").finish_non_exhaustive()
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&self, to: PeerId, message: Message) -> Result<(), NotConnected> {
            self.sent
                .lock()
                .unwrap()
                .push((to, message.clone(), Instant::now()));

            let replies = match self.responder.lock().unwrap().as_ref() {
                Some(responder) => responder(to, &message),
                None => vec![],
            };

            if let Some(node) = self.node.get().and_then(Weak::upgrade) {
                for body in replies {
                    node.handle_message(to, Message::new(message.uid, body));
                }
            }

            Ok(())
        }
    }

    pub(crate) struct ScriptedNetwork {
        pub transport: Arc<ScriptedTransport>,
        pub table: Arc<PeerTable>,
        peers: Vec<PeerId>,
        node: Option<Node>,
    }

    impl ScriptedNetwork {
        pub fn peer(&self, index: usize) -> PeerHandle {
            self.table.handle(self.peers[index]).unwrap()
        }

        /// Script the replies of every peer, by the peer and the message it received.
        pub fn respond<F>(&self, responder: F)
        where
            F: Fn(PeerId, &Message) -> Vec<MessageBody> + Send + Sync + 'static,
        {
            *self.transport.responder.lock().unwrap() = Some(Box::new(responder));
        }

        /// A message from a peer to the node under test.
        pub fn deliver(&self, from: PeerId, uid: Uid, body: MessageBody) {
            if let Some(node) = &self.node {
                node.handle_message(from, Message::new(uid, body));
            }
        }

        pub fn sent_to(&self, peer: PeerId) -> Vec<(Message, Instant)> {
            self.transport
                .sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _, _)| *to == peer)
                .map(|(_, message, at)| (message.clone(), *at))
                .collect()
        }

        /// Wait until the node sent a message of `kind` to `peer`.
        pub fn wait_sent(&self, peer: PeerId, kind: MessageKind, timeout: Duration) -> Instant {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some((_, at)) = self
                    .sent_to(peer)
                    .into_iter()
                    .find(|(message, _)| message.kind() == kind)
                {
                    return at;
                }
                assert!(Instant::now() < deadline, "{:?} never sent to {}", kind, peer);
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// A node whose peers are played by a script, with boundary coins that always
    /// decrement.
    pub(crate) fn scripted_builder(location: Location, peers: &[f64]) -> (NodeBuilder, ScriptedNetwork) {
        let table = Arc::new(PeerTable::new());
        let peers = peers
            .iter()
            .map(|value| table.add_with_coins(Location::new(*value).unwrap(), HtlCoins::ALWAYS))
            .collect();
        let transport = Arc::new(ScriptedTransport::default());

        let builder = Node::builder()
            .location(location)
            .coins(HtlCoins::ALWAYS)
            .transport(transport.clone())
            .peers(table.clone());

        (
            builder,
            ScriptedNetwork {
                transport,
                table,
                peers,
                node: None,
            },
        )
    }

    pub(crate) fn attach(builder: NodeBuilder, mut network: ScriptedNetwork) -> (Node, ScriptedNetwork) {
        let node = builder.build().unwrap();
        network
            .transport
            .node
            .set(Arc::downgrade(node.context()))
            .unwrap();
        network.node = Some(node.clone());

        (node, network)
    }

    pub(crate) fn scripted_node(
        config: Config,
        location: Location,
        peers: &[f64],
    ) -> (Node, ScriptedNetwork) {
        let (builder, network) = scripted_builder(location, peers);
        attach(builder.config(config), network)
    }

    pub(crate) fn quick_config() -> Config {
        Config {
            accepted_timeout: Duration::from_millis(500),
            search_timeout: Duration::from_secs(2),
            data_insert_timeout: Duration::from_millis(500),
            transfer_completion_timeout: Duration::from_secs(1),
            completion_poll_interval: Duration::from_millis(20),
            packet_timeout: Duration::from_millis(500),
            block: BlockGeometry {
                packets: 4,
                packet_size: 8,
            },
            ..Config::default()
        }
    }

    fn chk_block(fill: u8) -> ChkBlock {
        ChkBlock::new(vec![fill; 6], vec![fill; 32])
    }

    fn packets(data: &Bytes) -> Vec<MessageBody> {
        data.chunks(8)
            .enumerate()
            .map(|(index, chunk)| MessageBody::Packet {
                index: index as u32,
                data: Bytes::copy_from_slice(chunk),
            })
            .collect()
    }

    fn around(target: Location, offset: f64) -> f64 {
        (target.value() + offset).rem_euclid(1.0)
    }

    #[derive(Debug, Default)]
    /// Records when each block was committed.
    struct RecordingStore {
        inner: LruStore,
        puts: Mutex<Vec<Instant>>,
    }

    impl BlockStore for RecordingStore {
        fn fetch(&self, key: &Key) -> Option<Block> {
            self.inner.fetch(key)
        }

        fn put(&self, block: Block) {
            self.puts.lock().unwrap().push(Instant::now());
            self.inner.put(block)
        }
    }

    #[derive(Debug, Default)]
    /// Remembers every UID ever locked.
    struct RecordingRegistry {
        inner: UidTracker,
        locked: Mutex<Vec<Uid>>,
    }

    impl UidRegistry for RecordingRegistry {
        fn lock(&self, uid: Uid, kind: UidKind) -> bool {
            let locked = self.inner.lock(uid, kind);
            if locked {
                self.locked.lock().unwrap().push(uid);
            }
            locked
        }

        fn unlock(&self, uid: Uid, kind: UidKind) {
            self.inner.unlock(uid, kind)
        }

        fn running(&self) -> usize {
            self.inner.running()
        }
    }

    #[test]
    fn missing_transport_is_an_error() {
        let result = Node::builder().peers(Arc::new(PeerTable::new())).build();

        assert!(matches!(
            result,
            Err(Error::BuilderMissingFieldError("transport"))
        ));
    }

    #[test]
    fn no_peers_at_all() {
        let (node, _network) = scripted_node(quick_config(), Location::new(0.3).unwrap(), &[]);
        let block = chk_block(1);

        assert_eq!(
            node.get(&Key::Chk(*block.key())),
            Err(GetError::Failed(RequestStatus::RouteNotFound))
        );

        let outcome = node
            .put_chk(
                block,
                PutOptions {
                    htl: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(outcome.status, InsertStatus::RouteReallyNotFound);
    }

    #[test]
    fn wrong_block_size_is_rejected() {
        let (node, _network) = scripted_node(quick_config(), Location::new(0.3).unwrap(), &[]);

        let result = node.put_chk(ChkBlock::new(vec![1; 6], vec![1; 31]), PutOptions::default());

        assert!(matches!(
            result,
            Err(PutError::InvalidBlock(Error::InvalidBlockSize {
                expected: 32,
                got: 31
            }))
        ));
    }

    #[test]
    fn loop_rejection_then_found() {
        let block = chk_block(2);
        let store = Arc::new(RecordingStore::default());
        let (builder, network) = scripted_builder(Location::new(0.0).unwrap(), &[0.2, 0.7]);
        let (node, network) = attach(builder.config(quick_config()).store(store.clone()), network);

        let requests = AtomicUsize::new(0);
        let reply = block.clone();
        network.respond(move |_, message| match message.body {
            MessageBody::ChkDataRequest { .. } => {
                if requests.fetch_add(1, Ordering::SeqCst) == 0 {
                    return vec![MessageBody::RejectedLoop];
                }

                let mut replies = vec![
                    MessageBody::Accepted,
                    MessageBody::DataFound {
                        headers: reply.headers().clone(),
                    },
                ];
                replies.extend(packets(reply.data()));
                replies
            }
            _ => vec![],
        });

        let found = node.get(&Key::Chk(*block.key())).unwrap();

        assert_eq!(found, Block::Chk(block.clone()));
        assert_eq!(store.puts.lock().unwrap().len(), 1);
        assert_eq!(node.fetch_local(&Key::Chk(*block.key())), Some(Block::Chk(block)));
    }

    #[test]
    fn corrupt_insert_is_not_stored() {
        let (node, network) = scripted_node(quick_config(), Location::new(0.0).unwrap(), &[0.2, 0.7]);
        let upstream = network.peer(0).id;
        let downstream = network.peer(1).id;

        network.respond(move |to, message| match (to == downstream, &message.body) {
            (true, MessageBody::InsertRequest { .. }) => vec![MessageBody::Accepted],
            (true, MessageBody::DataInsert { .. }) => vec![MessageBody::DataInsertRejected {
                reason: RejectReason::VerifyFailed,
            }],
            _ => vec![],
        });

        let block = chk_block(3);
        let uid = Uid::random();
        network.deliver(
            upstream,
            uid,
            MessageBody::InsertRequest {
                htl: 5,
                target: block.key().routing_key().location(),
                key: *block.key(),
            },
        );
        network.deliver(
            upstream,
            uid,
            MessageBody::DataInsert {
                headers: block.headers().clone(),
            },
        );
        for packet in packets(&Bytes::from(vec![9u8; 32])) {
            network.deliver(upstream, uid, packet);
        }

        network.wait_sent(
            upstream,
            MessageKind::InsertTransfersCompleted,
            Duration::from_secs(5),
        );

        let replies: Vec<MessageBody> = network
            .sent_to(upstream)
            .into_iter()
            .map(|(message, _)| message.body)
            .collect();
        assert!(replies
            .iter()
            .any(|body| matches!(body, MessageBody::RouteNotFound { .. })));
        assert!(replies.contains(&MessageBody::DataInsertRejected {
            reason: RejectReason::VerifyFailed
        }));
        assert_eq!(node.fetch_local(&Key::Chk(*block.key())), None);
    }

    #[test]
    fn ssk_collision_carries_older_block() {
        let signer = SigningKey::from_bytes(&[7; 32]);
        let old = SskBlock::new(&signer, b"doc", b"first");
        let new = SskBlock::new(&signer, b"doc", b"second");
        let target = old.key().routing_key().location();

        let (node, network) = scripted_node(
            quick_config(),
            Location::new(around(target, 0.5)).unwrap(),
            &[target.value(), around(target, 0.25)],
        );
        let first = network.peer(0).id;
        let second = network.peer(1).id;

        let stored = old.clone();
        network.respond(move |to, message| match &message.body {
            MessageBody::SskInsertRequest { .. } => vec![MessageBody::SskAccepted {
                need_pub_key: false,
            }],
            MessageBody::SskInsertRequestData { .. } if to == first => vec![
                MessageBody::SskDataFoundHeaders {
                    headers: stored.headers(),
                },
                MessageBody::SskDataFoundData {
                    data: stored.data().clone(),
                },
                MessageBody::RouteNotFound { htl: 3 },
            ],
            MessageBody::SskInsertRequestData { .. } => vec![MessageBody::InsertReply],
            _ => vec![],
        });

        let outcome = node.put_ssk(new, PutOptions::default()).unwrap();

        assert_eq!(outcome.status, InsertStatus::Success);
        assert!(outcome.has_collided);
        assert_eq!(outcome.canonical, Some(old.clone()));

        let carried: Vec<Bytes> = network
            .sent_to(second)
            .into_iter()
            .filter_map(|(message, _)| match message.body {
                MessageBody::SskInsertRequestData { data } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(carried, vec![old.data().clone()]);
    }

    #[test]
    fn identical_ssk_is_not_a_collision() {
        let signer = SigningKey::from_bytes(&[8; 32]);
        let block = SskBlock::new(&signer, b"doc", b"same");

        let (node, network) = scripted_node(quick_config(), Location::new(0.1).unwrap(), &[0.6]);

        let stored = block.clone();
        network.respond(move |_, message| match &message.body {
            MessageBody::SskInsertRequest { .. } => vec![MessageBody::SskAccepted {
                need_pub_key: true,
            }],
            MessageBody::SskPubKey { .. } => vec![
                MessageBody::SskPubKeyAccepted,
                MessageBody::SskDataFoundHeaders {
                    headers: stored.headers(),
                },
                MessageBody::SskDataFoundData {
                    data: stored.data().clone(),
                },
                MessageBody::InsertReply,
            ],
            _ => vec![],
        });

        let outcome = node.put_ssk(block.clone(), PutOptions::default()).unwrap();

        assert_eq!(outcome.status, InsertStatus::Success);
        assert!(!outcome.has_collided);
        assert_eq!(outcome.canonical, Some(block));
    }

    #[test]
    fn insert_forks_when_cacheable() {
        let block = chk_block(4);
        let target = block.key().routing_key().location();
        let registry = Arc::new(RecordingRegistry::default());

        let (builder, network) = scripted_builder(
            target,
            &[around(target, 0.1), around(target, 0.2)],
        );
        let (node, network) = attach(
            builder
                .config(quick_config())
                .uid_registry(registry.clone()),
            network,
        );
        let first = network.peer(0).id;

        network.respond(move |_, message| match &message.body {
            MessageBody::InsertRequest { .. } => vec![MessageBody::Accepted],
            MessageBody::DataInsert { .. } => vec![MessageBody::InsertReply],
            MessageBody::Packet { index: 3, .. } => vec![MessageBody::InsertTransfersCompleted {
                any_timed_out: false,
            }],
            _ => vec![],
        });

        let outcome = node
            .put_chk(
                block,
                PutOptions {
                    htl: Some(9),
                    fork_on_cacheable: Some(true),
                },
            )
            .unwrap();

        assert_eq!(outcome.status, InsertStatus::Success);
        assert!(!outcome.any_transfers_failed);

        let locked = registry.locked.lock().unwrap().clone();
        assert_eq!(locked.len(), 2);

        let uids: HashSet<Uid> = network
            .sent_to(first)
            .into_iter()
            .map(|(message, _)| message.uid)
            .collect();
        assert_eq!(uids, HashSet::from([locked[1]]));

        assert!(!registry.inner.is_locked(locked[0]));
        assert!(!registry.inner.is_locked(locked[1]));
    }

    #[test]
    fn commit_precedes_completion_notice() {
        let block = chk_block(5);
        let store = Arc::new(RecordingStore::default());
        let (builder, network) = scripted_builder(Location::new(0.0).unwrap(), &[0.2, 0.7]);
        let (_node, network) = attach(builder.config(quick_config()).store(store.clone()), network);
        let upstream = network.peer(0).id;

        network.respond(move |to, message| match &message.body {
            _ if to == upstream => vec![],
            MessageBody::InsertRequest { .. } => vec![MessageBody::Accepted],
            MessageBody::DataInsert { .. } => vec![MessageBody::InsertReply],
            MessageBody::Packet { index: 3, .. } => vec![MessageBody::InsertTransfersCompleted {
                any_timed_out: false,
            }],
            _ => vec![],
        });

        let uid = Uid::random();
        network.deliver(
            upstream,
            uid,
            MessageBody::InsertRequest {
                htl: 5,
                target: block.key().routing_key().location(),
                key: *block.key(),
            },
        );
        network.deliver(
            upstream,
            uid,
            MessageBody::DataInsert {
                headers: block.headers().clone(),
            },
        );
        for packet in packets(block.data()) {
            network.deliver(upstream, uid, packet);
        }

        let notified = network.wait_sent(
            upstream,
            MessageKind::InsertTransfersCompleted,
            Duration::from_secs(5),
        );

        let puts = store.puts.lock().unwrap().clone();
        assert_eq!(puts.len(), 1);
        assert!(puts[0] <= notified);
        assert!(network
            .sent_to(upstream)
            .iter()
            .any(|(message, _)| message.body == MessageBody::InsertReply));
    }

    #[test]
    fn duplicate_uid_is_rejected_as_loop() {
        let (_node, network) = scripted_node(quick_config(), Location::new(0.0).unwrap(), &[0.2, 0.7]);
        let upstream = network.peer(0).id;
        let block = chk_block(6);
        let uid = Uid::random();

        let request = MessageBody::ChkDataRequest {
            htl: 3,
            target: block.key().routing_key().location(),
            key: *block.key(),
        };
        network.deliver(upstream, uid, request.clone());
        network.deliver(upstream, uid, request);

        network.wait_sent(upstream, MessageKind::RejectedLoop, Duration::from_secs(2));
    }

    #[test]
    fn overloaded_node_rejects_new_chains() {
        let config = Config {
            max_running_chains: 0,
            ..quick_config()
        };
        let (node, network) = scripted_node(config, Location::new(0.0).unwrap(), &[0.2]);
        let upstream = network.peer(0).id;
        let block = chk_block(7);

        network.deliver(
            upstream,
            Uid::random(),
            MessageBody::ChkDataRequest {
                htl: 3,
                target: block.key().routing_key().location(),
                key: *block.key(),
            },
        );

        network.wait_sent(upstream, MessageKind::RejectedOverload, Duration::from_secs(1));
        assert_eq!(node.get(&Key::Chk(*block.key())), Err(GetError::Overloaded));
    }

    #[test]
    fn request_from_unknown_peer_is_dropped() {
        let (_node, network) = scripted_node(quick_config(), Location::new(0.0).unwrap(), &[0.2]);
        let block = chk_block(8);

        network.deliver(
            PeerId(42),
            Uid::random(),
            MessageBody::ChkDataRequest {
                htl: 3,
                target: block.key().routing_key().location(),
                key: *block.key(),
            },
        );

        thread::sleep(Duration::from_millis(50));
        assert!(network.sent_to(PeerId(42)).is_empty());
    }

    #[test]
    fn relayed_overloads_do_not_extend_the_search() {
        let config = Config {
            search_timeout: Duration::from_secs(1),
            ..quick_config()
        };
        let (node, network) = scripted_node(config, Location::new(0.0).unwrap(), &[0.5]);
        let peer = network.peer(0).id;

        network.respond(|_, message| match message.body {
            MessageBody::ChkDataRequest { .. } => vec![MessageBody::Accepted],
            _ => vec![],
        });

        let key = Key::Chk(*chk_block(9).key());
        let getter = node.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || getter.get(&key));

        network.wait_sent(peer, MessageKind::ChkDataRequest, Duration::from_secs(1));
        let uid = network.sent_to(peer)[0].0.uid;

        while !handle.is_finished() && started.elapsed() < Duration::from_secs(5) {
            network.deliver(peer, uid, MessageBody::RejectedOverload { local: false });
            thread::sleep(Duration::from_millis(200));
        }

        assert_eq!(
            handle.join().unwrap(),
            Err(GetError::Failed(RequestStatus::RejectedOverload))
        );
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn insert_stops_where_htl_runs_out() {
        let block = chk_block(10);
        let target = block.key().routing_key().location();
        let (node, network) = scripted_node(
            quick_config(),
            target,
            &[around(target, 0.1), around(target, 0.2)],
        );

        network.respond(|_, message| match message.body {
            MessageBody::InsertRequest { .. } => vec![MessageBody::RejectedLoop],
            _ => vec![],
        });

        let outcome = node
            .put_chk(
                block,
                PutOptions {
                    htl: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();

        let htls: Vec<Htl> = (0..2)
            .flat_map(|i| network.sent_to(network.peer(i).id))
            .filter_map(|(message, _)| match message.body {
                MessageBody::InsertRequest { htl, .. } => Some(htl),
                _ => None,
            })
            .collect();

        assert_eq!(htls, vec![1]);
        // Nobody accepted, so running out of HTL is not a success.
        assert_eq!(outcome.status, InsertStatus::RouteNotFound);
    }

    #[test]
    fn accepted_insert_succeeds_when_htl_runs_out() {
        let block = chk_block(11);
        let target = block.key().routing_key().location();
        let (node, network) = scripted_node(
            quick_config(),
            target,
            &[around(target, 0.1), around(target, 0.2)],
        );

        network.respond(|_, message| match message.body {
            MessageBody::InsertRequest { .. } => vec![MessageBody::Accepted],
            MessageBody::DataInsert { .. } => vec![MessageBody::RouteNotFound { htl: 1 }],
            MessageBody::Packet { index: 3, .. } => vec![MessageBody::InsertTransfersCompleted {
                any_timed_out: false,
            }],
            _ => vec![],
        });

        let outcome = node
            .put_chk(
                block,
                PutOptions {
                    htl: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(outcome.status, InsertStatus::Success);
        assert_eq!(outcome.htl, 0);
    }

    #[test]
    fn request_is_cancelled_when_predecessor_leaves() {
        let registry = Arc::new(RecordingRegistry::default());
        let (builder, network) = scripted_builder(Location::new(0.0).unwrap(), &[0.2, 0.7]);
        let (node, network) = attach(
            builder
                .config(quick_config())
                .uid_registry(registry.clone()),
            network,
        );
        let upstream = network.peer(0).id;
        let downstream = network.peer(1).id;

        network.respond(move |to, message| match message.body {
            MessageBody::ChkDataRequest { .. } if to == downstream => vec![MessageBody::Accepted],
            _ => vec![],
        });

        let block = chk_block(12);
        let uid = Uid::random();
        network.deliver(
            upstream,
            uid,
            MessageBody::ChkDataRequest {
                htl: 5,
                target: block.key().routing_key().location(),
                key: *block.key(),
            },
        );
        network.wait_sent(downstream, MessageKind::ChkDataRequest, Duration::from_secs(1));

        let started = Instant::now();
        node.peer_disconnected(upstream);

        while registry.inner.is_locked(uid) {
            assert!(started.elapsed() < Duration::from_secs(1), "request outlived its predecessor");
            thread::sleep(Duration::from_millis(5));
        }

        let replies: Vec<MessageBody> = network
            .sent_to(upstream)
            .into_iter()
            .map(|(message, _)| message.body)
            .collect();
        assert_eq!(replies, vec![MessageBody::Accepted]);
    }

    #[test]
    fn failed_receive_rejects_upstream_and_stops_forwarding() {
        let config = Config {
            search_timeout: Duration::from_secs(10),
            ..quick_config()
        };
        let (node, network) = scripted_node(config, Location::new(0.0).unwrap(), &[0.2, 0.7]);
        let upstream = network.peer(0).id;
        let downstream = network.peer(1).id;

        network.respond(move |to, message| match &message.body {
            MessageBody::InsertRequest { .. } if to == downstream => vec![MessageBody::Accepted],
            _ => vec![],
        });

        let block = chk_block(13);
        let uid = Uid::random();
        let started = Instant::now();
        network.deliver(
            upstream,
            uid,
            MessageBody::InsertRequest {
                htl: 5,
                target: block.key().routing_key().location(),
                key: *block.key(),
            },
        );
        network.deliver(
            upstream,
            uid,
            MessageBody::DataInsert {
                headers: block.headers().clone(),
            },
        );
        // Half the payload, then silence.
        for packet in packets(block.data()).into_iter().take(2) {
            network.deliver(upstream, uid, packet);
        }

        network.wait_sent(
            upstream,
            MessageKind::InsertTransfersCompleted,
            Duration::from_secs(5),
        );
        assert!(started.elapsed() < Duration::from_secs(5));

        let replies: Vec<MessageBody> = network
            .sent_to(upstream)
            .into_iter()
            .map(|(message, _)| message.body)
            .collect();
        assert!(replies.contains(&MessageBody::DataInsertRejected {
            reason: RejectReason::ReceiveFailed
        }));
        // A forwarder that ran into its search timeout would have reported overload.
        assert!(!replies.iter().any(|body| matches!(
            body,
            MessageBody::InsertReply
                | MessageBody::RouteNotFound { .. }
                | MessageBody::RejectedOverload { .. }
        )));
        assert_eq!(node.fetch_local(&Key::Chk(*block.key())), None);
    }

    #[test]
    fn unsettled_transfer_fails_at_the_deadline() {
        let (node, network) = scripted_node(quick_config(), Location::new(0.0).unwrap(), &[0.7]);

        network.respond(|_, message| match message.body {
            MessageBody::InsertRequest { .. } => vec![MessageBody::Accepted],
            MessageBody::DataInsert { .. } => vec![MessageBody::InsertReply],
            _ => vec![],
        });

        let started = Instant::now();
        let outcome = node.put_chk(chk_block(14), PutOptions::default()).unwrap();

        assert_eq!(outcome.status, InsertStatus::Success);
        assert!(outcome.any_transfers_failed);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn disconnected_hop_is_dropped_from_the_wait() {
        let config = Config {
            transfer_completion_timeout: Duration::from_secs(5),
            ..quick_config()
        };
        let (node, network) = scripted_node(config, Location::new(0.0).unwrap(), &[0.7]);
        let downstream = network.peer(0).id;

        network.respond(|_, message| match message.body {
            MessageBody::InsertRequest { .. } => vec![MessageBody::Accepted],
            MessageBody::DataInsert { .. } => vec![MessageBody::InsertReply],
            _ => vec![],
        });

        let inserter = node.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || inserter.put_chk(chk_block(15), PutOptions::default()));

        // Wait for the last packet before the hop goes away.
        loop {
            let sent_last = network.sent_to(downstream).iter().any(|(message, _)| {
                matches!(message.body, MessageBody::Packet { index: 3, .. })
            });
            if sent_last {
                break;
            }
            assert!(started.elapsed() < Duration::from_secs(2), "payload never sent");
            thread::sleep(Duration::from_millis(5));
        }
        network.table.disconnect(downstream);
        node.peer_disconnected(downstream);

        let outcome = handle.join().unwrap().unwrap();

        // The InsertReply may be forgotten with the hop if it was not consumed yet.
        assert!(matches!(
            outcome.status,
            InsertStatus::Success | InsertStatus::RouteNotFound
        ));
        assert!(!outcome.any_transfers_failed);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn ssk_insert_forks_when_cacheable() {
        let signer = SigningKey::from_bytes(&[9; 32]);
        let block = SskBlock::new(&signer, b"doc", b"forked");
        let target = block.key().routing_key().location();
        let registry = Arc::new(RecordingRegistry::default());

        let (builder, network) = scripted_builder(
            target,
            &[around(target, 0.1), around(target, 0.2)],
        );
        let (node, network) = attach(
            builder
                .config(quick_config())
                .uid_registry(registry.clone()),
            network,
        );
        let first = network.peer(0).id;

        network.respond(|_, message| match &message.body {
            MessageBody::SskInsertRequest { .. } => vec![MessageBody::SskAccepted {
                need_pub_key: false,
            }],
            MessageBody::SskInsertRequestData { .. } => vec![MessageBody::InsertReply],
            _ => vec![],
        });

        let outcome = node
            .put_ssk(
                block,
                PutOptions {
                    htl: Some(9),
                    fork_on_cacheable: Some(true),
                },
            )
            .unwrap();

        assert_eq!(outcome.status, InsertStatus::Success);

        let locked = registry.locked.lock().unwrap().clone();
        assert_eq!(locked.len(), 2);

        let uids: HashSet<Uid> = network
            .sent_to(first)
            .into_iter()
            .map(|(message, _)| message.uid)
            .collect();
        assert_eq!(uids, HashSet::from([locked[1]]));

        assert!(!registry.inner.is_locked(locked[0]));
        assert!(!registry.inner.is_locked(locked[1]));
    }
}
