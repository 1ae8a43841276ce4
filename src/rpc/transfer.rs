//! One-shot block transfer over fixed size packets.
//!
//! A [PartialBlock] is filled by a [BlockReceiver] and drained, possibly at the
//! same time, by any number of [BlockTransmitter]s. A transfer can not be resumed
//! from another peer once it is aborted.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::common::{AbortReason, Message, MessageBody, MessageKind, PeerId, Uid};
use crate::{Error, Result};

use super::{CancelToken, Dispatcher, MessageFilter, NotConnected, Transport, WaitResult};

/// Default number of packets in a CHK block.
pub const PACKETS_IN_BLOCK: usize = 32;
/// Default packet payload size.
pub const PACKET_SIZE: usize = 1024;

const TRANSFER_KINDS: &[MessageKind] = &[MessageKind::Packet, MessageKind::SendAborted];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a block is cut into packets.
pub struct BlockGeometry {
    pub packets: usize,
    pub packet_size: usize,
}

impl BlockGeometry {
    pub fn block_size(&self) -> usize {
        self.packets * self.packet_size
    }
}

impl Default for BlockGeometry {
    fn default() -> Self {
        Self {
            packets: PACKETS_IN_BLOCK,
            packet_size: PACKET_SIZE,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    #[error("Transfer aborted: {0}")]
    Aborted(AbortReason),

    #[error("Block is not fully received yet")]
    Incomplete,

    #[error("Invalid packet {0}")]
    InvalidPacket(u32),

    #[error(transparent)]
    NotConnected(#[from] NotConnected),
}

#[derive(Debug)]
struct BlockState {
    packets: Vec<Option<Bytes>>,
    received: usize,
    aborted: Option<AbortReason>,
}

#[derive(Debug)]
/// A block being received, shared between its receiver and transmitters.
pub struct PartialBlock {
    geometry: BlockGeometry,
    state: Mutex<BlockState>,
    changed: Condvar,
}

impl PartialBlock {
    pub fn new(geometry: BlockGeometry) -> Self {
        Self {
            geometry,
            state: Mutex::new(BlockState {
                packets: vec![None; geometry.packets],
                received: 0,
                aborted: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// A block that is already fully known, as when inserting local data.
    pub fn complete(geometry: BlockGeometry, data: &Bytes) -> Result<Self> {
        if data.len() != geometry.block_size() {
            return Err(Error::InvalidBlockSize {
                expected: geometry.block_size(),
                got: data.len(),
            });
        }

        let block = Self::new(geometry);
        {
            let mut state = block.lock();
            for (index, slot) in state.packets.iter_mut().enumerate() {
                let start = index * geometry.packet_size;
                *slot = Some(data.slice(start..start + geometry.packet_size));
            }
            state.received = geometry.packets;
        }

        Ok(block)
    }

    // === Getters ===

    pub fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    pub fn all_received(&self) -> bool {
        self.lock().received == self.geometry.packets
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted.is_some()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.lock().aborted
    }

    // === Public Methods ===

    /// Store a packet, duplicates are ignored.
    pub fn add_packet(&self, index: u32, data: Bytes) -> Result<(), TransferError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(reason) = state.aborted {
            return Err(TransferError::Aborted(reason));
        }
        if index as usize >= self.geometry.packets || data.len() != self.geometry.packet_size {
            return Err(TransferError::InvalidPacket(index));
        }

        let slot = &mut state.packets[index as usize];
        if slot.is_none() {
            *slot = Some(data);
            state.received += 1;
            self.changed.notify_all();
        }

        Ok(())
    }

    /// Abort the transfer, only the first reason is kept.
    pub fn abort(&self, reason: AbortReason) {
        let mut state = self.lock();

        if state.aborted.is_none() && state.received < self.geometry.packets {
            state.aborted = Some(reason);
            self.changed.notify_all();
        }
    }

    /// Block until packet `index` is available.
    pub fn wait_packet(&self, index: usize, timeout: Duration) -> Result<Bytes, TransferError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if let Some(Some(packet)) = state.packets.get(index) {
                return Ok(packet.clone());
            }
            if let Some(reason) = state.aborted {
                return Err(TransferError::Aborted(reason));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransferError::Aborted(AbortReason::Timeout));
            }

            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// The whole payload, once every packet arrived.
    pub fn data(&self) -> Result<Bytes, TransferError> {
        let state = self.lock();

        if let Some(reason) = state.aborted {
            return Err(TransferError::Aborted(reason));
        }
        if state.received < self.geometry.packets {
            return Err(TransferError::Incomplete);
        }

        let mut data = BytesMut::with_capacity(self.geometry.block_size());
        for packet in state.packets.iter().flatten() {
            data.extend_from_slice(packet);
        }

        Ok(data.freeze())
    }

    fn lock(&self) -> MutexGuard<'_, BlockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
/// Streams a [PartialBlock] to one peer as packets become available.
pub struct BlockTransmitter<'a> {
    pub transport: &'a dyn Transport,
    pub to: PeerId,
    pub uid: Uid,
    pub block: &'a PartialBlock,
    pub packet_timeout: Duration,
    pub cancel: Option<&'a CancelToken>,
}

impl BlockTransmitter<'_> {
    pub fn send(&self) -> Result<(), TransferError> {
        for index in 0..self.block.geometry().packets {
            if self.cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(self.abort(AbortReason::Cancelled));
            }

            let data = match self.block.wait_packet(index, self.packet_timeout) {
                Ok(data) => data,
                Err(TransferError::Aborted(reason)) => {
                    let reason = match reason {
                        AbortReason::Timeout => AbortReason::Timeout,
                        _ => AbortReason::UpstreamFailed,
                    };
                    return Err(self.abort(reason));
                }
                Err(error) => return Err(error),
            };

            self.transport.send(
                self.to,
                Message::new(
                    self.uid,
                    MessageBody::Packet {
                        index: index as u32,
                        data,
                    },
                ),
            )?;
        }

        trace!(uid = %self.uid, to = %self.to, "Block transmitted");
        Ok(())
    }

    fn abort(&self, reason: AbortReason) -> TransferError {
        debug!(uid = %self.uid, to = %self.to, ?reason, "Aborting block transmission");

        let _ = self.transport.send(
            self.to,
            Message::new(self.uid, MessageBody::SendAborted { reason }),
        );

        TransferError::Aborted(reason)
    }
}

#[derive(Debug)]
/// Fills a [PartialBlock] from the packets one peer sends under a UID.
pub struct BlockReceiver<'a> {
    pub dispatcher: &'a Arc<Dispatcher>,
    pub from: PeerId,
    pub uid: Uid,
    pub block: &'a PartialBlock,
    pub packet_timeout: Duration,
    pub cancel: Option<&'a CancelToken>,
}

impl BlockReceiver<'_> {
    /// Receive until the block is complete, aborting it on any failure.
    pub fn receive(&self) -> Result<(), TransferError> {
        let subscription = self
            .dispatcher
            .subscribe(MessageFilter::new(self.uid, self.from, TRANSFER_KINDS));

        while !self.block.all_received() {
            if let Some(reason) = self.block.abort_reason() {
                return Err(TransferError::Aborted(reason));
            }

            let reason = match subscription.recv(self.packet_timeout, self.cancel) {
                WaitResult::Matched(Message {
                    body: MessageBody::Packet { index, data },
                    ..
                }) => match self.block.add_packet(index, data) {
                    Ok(()) => continue,
                    Err(TransferError::InvalidPacket(index)) => {
                        debug!(uid = %self.uid, from = %self.from, index, "Invalid packet");
                        AbortReason::SenderAborted
                    }
                    Err(error) => return Err(error),
                },
                WaitResult::Matched(_) => AbortReason::SenderAborted,
                WaitResult::TimedOut => AbortReason::Timeout,
                WaitResult::Disconnected => AbortReason::Disconnected,
                WaitResult::Cancelled => AbortReason::Cancelled,
            };

            debug!(uid = %self.uid, from = %self.from, ?reason, "Block receive failed");
            self.block.abort(reason);
            return Err(TransferError::Aborted(reason));
        }

        trace!(uid = %self.uid, from = %self.from, "Block received");
        Ok(())
    }
}
