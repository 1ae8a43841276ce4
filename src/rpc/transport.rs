//! Outbound message delivery.

use std::fmt::Debug;

use crate::common::{Message, PeerId};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{0} is not connected")]
/// The message could not be handed to the peer's session.
pub struct NotConnected(pub PeerId);

/// Sends messages to connected peers.
///
/// Framing, encryption and retransmission are the implementor's business; a
/// successful send only means the message was queued for the peer.
pub trait Transport: Send + Sync + Debug {
    fn send(&self, to: PeerId, message: Message) -> Result<(), NotConnected>;
}
