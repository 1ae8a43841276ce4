//! In-memory network of nodes, for tests and demos.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::{debug, error};

use crate::common::{Location, Message, PeerId};
use crate::node::{Node, NodeContext};
use crate::routing::PeerTable;
use crate::rpc::{Config, NotConnected, Transport};
use crate::Result;

#[derive(Debug, Clone)]
struct Link {
    remote: Weak<NodeContext>,
    /// How the remote node knows this one.
    as_peer: PeerId,
}

#[derive(Debug, Default)]
/// Hands every message straight to the remote node, through the wire codec.
struct MemoryTransport {
    links: RwLock<HashMap<PeerId, Link>>,
}

impl MemoryTransport {
    fn link(&self, peer: PeerId, link: Link) {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, link);
    }

    fn unlink(&self, peer: PeerId) {
        self.links
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, to: PeerId, message: Message) -> Result<(), NotConnected> {
        let link = self
            .links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&to)
            .cloned()
            .ok_or(NotConnected(to))?;
        let remote = link.remote.upgrade().ok_or(NotConnected(to))?;

        match message.to_bytes().and_then(Message::from_bytes) {
            Ok(message) => remote.handle_message(link.as_peer, message),
            Err(error) => error!(%to, ?error, "Dropping message the codec can not carry"),
        }

        Ok(())
    }
}

#[derive(Debug)]
/// Fully connected network of nodes at evenly spaced ring positions.
pub struct Testnet {
    pub nodes: Vec<Node>,
    tables: Vec<Arc<PeerTable>>,
    transports: Vec<Arc<MemoryTransport>>,
    /// `peer_ids[i][j]` is how node `i` knows node `j`.
    peer_ids: Vec<Vec<Option<PeerId>>>,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet> {
        Testnet::with_config(count, Config::default())
    }

    pub fn with_config(count: usize, config: Config) -> Result<Testnet> {
        let mut nodes = Vec::with_capacity(count);
        let mut tables = Vec::with_capacity(count);
        let mut transports = Vec::with_capacity(count);

        for i in 0..count {
            let table = Arc::new(PeerTable::new());
            let transport = Arc::new(MemoryTransport::default());

            let node = Node::builder()
                .config(config.clone())
                .location(Location::new(i as f64 / count as f64)?)
                .peers(table.clone())
                .transport(transport.clone())
                .build()?;

            nodes.push(node);
            tables.push(table);
            transports.push(transport);
        }

        let peer_ids: Vec<Vec<Option<PeerId>>> = (0..count)
            .map(|i| {
                (0..count)
                    .map(|j| (i != j).then(|| tables[i].add(nodes[j].location())))
                    .collect()
            })
            .collect();

        for (i, transport) in transports.iter().enumerate() {
            for (j, node) in nodes.iter().enumerate() {
                if let (Some(peer), Some(as_peer)) = (peer_ids[i][j], peer_ids[j][i]) {
                    transport.link(
                        peer,
                        Link {
                            remote: Arc::downgrade(node.context()),
                            as_peer,
                        },
                    );
                }
            }
        }

        debug!(count, "Testnet is up");

        Ok(Testnet {
            nodes,
            tables,
            transports,
            peer_ids,
        })
    }

    /// Drop the connection between nodes `a` and `b`, on both sides.
    pub fn disconnect(&self, a: usize, b: usize) {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(peer) = self.peer_ids[from][to] {
                self.tables[from].disconnect(peer);
                self.transports[from].unlink(peer);
                self.nodes[from].peer_disconnected(peer);
            }
        }
    }
}
