//! Serialize and deserialize routing protocol messages.

mod internal;

use bytes::Bytes;
use serde_bytes::ByteBuf;

use crate::common::{ChkKey, Htl, Id, Location, SskKey, Uid};
use crate::{Error, Result};

use internal::WireMessage;

#[derive(Debug, PartialEq, Clone)]
/// A message exchanged between two adjacent hops of a chain.
pub struct Message {
    /// Chain identifier, shared by every hop of a request or insert.
    pub uid: Uid,
    pub body: MessageBody,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageBody {
    // === Requests ===
    ChkDataRequest {
        htl: Htl,
        target: Location,
        key: ChkKey,
    },
    SskDataRequest {
        htl: Htl,
        target: Location,
        key: SskKey,
        need_pub_key: bool,
    },
    InsertRequest {
        htl: Htl,
        target: Location,
        key: ChkKey,
    },
    SskInsertRequest {
        htl: Htl,
        target: Location,
        key: SskKey,
    },

    // === Accept phase ===
    Accepted,
    SskAccepted {
        need_pub_key: bool,
    },
    RejectedLoop,
    RejectedOverload {
        /// Set by the node that is itself overloaded, unset when relayed from further away.
        local: bool,
    },

    // === Request phase ===
    DataNotFound,
    DataFound {
        headers: Bytes,
    },
    RouteNotFound {
        htl: Htl,
    },
    SskDataFoundHeaders {
        headers: Bytes,
    },
    SskDataFoundData {
        data: Bytes,
    },
    SskPubKey {
        pubkey: [u8; 32],
    },
    SskPubKeyAccepted,

    // === Insert phase ===
    DataInsert {
        headers: Bytes,
    },
    SskInsertRequestHeaders {
        headers: Bytes,
    },
    SskInsertRequestData {
        data: Bytes,
    },
    InsertReply,
    RejectedTimeout,
    DataInsertRejected {
        reason: RejectReason,
    },
    InsertTransfersCompleted {
        any_timed_out: bool,
    },

    // === Block transfer ===
    Packet {
        index: u32,
        data: Bytes,
    },
    SendAborted {
        reason: AbortReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Discriminant of [MessageBody], used to correlate replies.
pub enum MessageKind {
    ChkDataRequest,
    SskDataRequest,
    InsertRequest,
    SskInsertRequest,
    Accepted,
    SskAccepted,
    RejectedLoop,
    RejectedOverload,
    DataNotFound,
    DataFound,
    RouteNotFound,
    SskDataFoundHeaders,
    SskDataFoundData,
    SskPubKey,
    SskPubKeyAccepted,
    DataInsert,
    SskInsertRequestHeaders,
    SskInsertRequestData,
    InsertReply,
    RejectedTimeout,
    DataInsertRejected,
    InsertTransfersCompleted,
    Packet,
    SendAborted,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Why a hop refused the payload of an insert.
pub enum RejectReason {
    #[error("payload failed verification")]
    VerifyFailed,
    #[error("payload was not fully received")]
    ReceiveFailed,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Why a block transfer was aborted.
pub enum AbortReason {
    #[error("timed out waiting for a packet")]
    Timeout,
    #[error("peer disconnected")]
    Disconnected,
    #[error("sender aborted the transfer")]
    SenderAborted,
    #[error("the upstream receive failed")]
    UpstreamFailed,
    #[error("transfer was cancelled")]
    Cancelled,
}

impl Message {
    pub fn new(uid: Uid, body: MessageBody) -> Message {
        Message { uid, body }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Whether this message opens a new chain on the receiving node.
    pub fn is_request(&self) -> bool {
        matches!(
            self.kind(),
            MessageKind::ChkDataRequest
                | MessageKind::SskDataRequest
                | MessageKind::InsertRequest
                | MessageKind::SskInsertRequest
        )
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_wire(WireMessage::from_bytes(bytes.as_ref())?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.to_wire().to_bytes().map_err(Error::BencodeError)
    }

    fn to_wire(&self) -> WireMessage {
        let mut wire = WireMessage {
            kind: self.kind().tag().to_string(),
            uid: self.uid.to_bytes().to_vec(),
            ..Default::default()
        };

        match &self.body {
            MessageBody::ChkDataRequest { htl, target, key }
            | MessageBody::InsertRequest { htl, target, key } => {
                wire.htl = Some(*htl as i64);
                wire.target = Some(ByteBuf::from(target.to_bytes().to_vec()));
                wire.key = Some(ByteBuf::from(key.0.to_vec()));
            }
            MessageBody::SskDataRequest {
                htl,
                target,
                key,
                need_pub_key,
            } => {
                wire.htl = Some(*htl as i64);
                wire.target = Some(ByteBuf::from(target.to_bytes().to_vec()));
                set_ssk_key(&mut wire, key);
                wire.flag = Some(*need_pub_key as i32);
            }
            MessageBody::SskInsertRequest { htl, target, key } => {
                wire.htl = Some(*htl as i64);
                wire.target = Some(ByteBuf::from(target.to_bytes().to_vec()));
                set_ssk_key(&mut wire, key);
            }
            MessageBody::SskAccepted { need_pub_key } => {
                wire.flag = Some(*need_pub_key as i32);
            }
            MessageBody::RejectedOverload { local } => {
                wire.flag = Some(*local as i32);
            }
            MessageBody::RouteNotFound { htl } => {
                wire.htl = Some(*htl as i64);
            }
            MessageBody::DataFound { headers }
            | MessageBody::SskDataFoundHeaders { headers }
            | MessageBody::DataInsert { headers }
            | MessageBody::SskInsertRequestHeaders { headers } => {
                wire.headers = Some(ByteBuf::from(headers.to_vec()));
            }
            MessageBody::SskDataFoundData { data } | MessageBody::SskInsertRequestData { data } => {
                wire.data = Some(ByteBuf::from(data.to_vec()));
            }
            MessageBody::SskPubKey { pubkey } => {
                wire.pubkey = Some(ByteBuf::from(pubkey.to_vec()));
            }
            MessageBody::DataInsertRejected { reason } => {
                wire.reason = Some(reason.code());
            }
            MessageBody::InsertTransfersCompleted { any_timed_out } => {
                wire.flag = Some(*any_timed_out as i32);
            }
            MessageBody::Packet { index, data } => {
                wire.index = Some(*index as i64);
                wire.data = Some(ByteBuf::from(data.to_vec()));
            }
            MessageBody::SendAborted { reason } => {
                wire.reason = Some(reason.code());
            }
            MessageBody::Accepted
            | MessageBody::RejectedLoop
            | MessageBody::DataNotFound
            | MessageBody::SskPubKeyAccepted
            | MessageBody::InsertReply
            | MessageBody::RejectedTimeout => {}
        }

        wire
    }

    fn from_wire(wire: WireMessage) -> Result<Message> {
        let uid = Uid::from_bytes(&wire.uid)?;
        let kind = MessageKind::from_tag(&wire.kind)
            .ok_or(Error::InvalidMessage("unknown message kind"))?;

        let body = match kind {
            MessageKind::ChkDataRequest => MessageBody::ChkDataRequest {
                htl: htl(&wire)?,
                target: target(&wire)?,
                key: chk_key(&wire)?,
            },
            MessageKind::SskDataRequest => MessageBody::SskDataRequest {
                htl: htl(&wire)?,
                target: target(&wire)?,
                key: ssk_key(&wire)?,
                need_pub_key: flag(&wire)?,
            },
            MessageKind::InsertRequest => MessageBody::InsertRequest {
                htl: htl(&wire)?,
                target: target(&wire)?,
                key: chk_key(&wire)?,
            },
            MessageKind::SskInsertRequest => MessageBody::SskInsertRequest {
                htl: htl(&wire)?,
                target: target(&wire)?,
                key: ssk_key(&wire)?,
            },
            MessageKind::Accepted => MessageBody::Accepted,
            MessageKind::SskAccepted => MessageBody::SskAccepted {
                need_pub_key: flag(&wire)?,
            },
            MessageKind::RejectedLoop => MessageBody::RejectedLoop,
            MessageKind::RejectedOverload => MessageBody::RejectedOverload {
                local: flag(&wire)?,
            },
            MessageKind::DataNotFound => MessageBody::DataNotFound,
            MessageKind::DataFound => MessageBody::DataFound {
                headers: headers(&wire)?,
            },
            MessageKind::RouteNotFound => MessageBody::RouteNotFound { htl: htl(&wire)? },
            MessageKind::SskDataFoundHeaders => MessageBody::SskDataFoundHeaders {
                headers: headers(&wire)?,
            },
            MessageKind::SskDataFoundData => MessageBody::SskDataFoundData {
                data: data(&wire)?,
            },
            MessageKind::SskPubKey => {
                let pubkey = wire
                    .pubkey
                    .as_deref()
                    .ok_or(Error::InvalidMessage("missing pubkey"))?
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::InvalidMessage("pubkey must be 32 bytes"))?;

                MessageBody::SskPubKey { pubkey }
            }
            MessageKind::SskPubKeyAccepted => MessageBody::SskPubKeyAccepted,
            MessageKind::DataInsert => MessageBody::DataInsert {
                headers: headers(&wire)?,
            },
            MessageKind::SskInsertRequestHeaders => MessageBody::SskInsertRequestHeaders {
                headers: headers(&wire)?,
            },
            MessageKind::SskInsertRequestData => MessageBody::SskInsertRequestData {
                data: data(&wire)?,
            },
            MessageKind::InsertReply => MessageBody::InsertReply,
            MessageKind::RejectedTimeout => MessageBody::RejectedTimeout,
            MessageKind::DataInsertRejected => MessageBody::DataInsertRejected {
                reason: RejectReason::from_code(reason(&wire)?)
                    .ok_or(Error::InvalidMessage("unknown reject reason"))?,
            },
            MessageKind::InsertTransfersCompleted => MessageBody::InsertTransfersCompleted {
                any_timed_out: flag(&wire)?,
            },
            MessageKind::Packet => MessageBody::Packet {
                index: wire
                    .index
                    .and_then(|index| u32::try_from(index).ok())
                    .ok_or(Error::InvalidMessage("missing or invalid packet index"))?,
                data: data(&wire)?,
            },
            MessageKind::SendAborted => MessageBody::SendAborted {
                reason: AbortReason::from_code(reason(&wire)?)
                    .ok_or(Error::InvalidMessage("unknown abort reason"))?,
            },
        };

        Ok(Message { uid, body })
    }
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::ChkDataRequest { .. } => MessageKind::ChkDataRequest,
            MessageBody::SskDataRequest { .. } => MessageKind::SskDataRequest,
            MessageBody::InsertRequest { .. } => MessageKind::InsertRequest,
            MessageBody::SskInsertRequest { .. } => MessageKind::SskInsertRequest,
            MessageBody::Accepted => MessageKind::Accepted,
            MessageBody::SskAccepted { .. } => MessageKind::SskAccepted,
            MessageBody::RejectedLoop => MessageKind::RejectedLoop,
            MessageBody::RejectedOverload { .. } => MessageKind::RejectedOverload,
            MessageBody::DataNotFound => MessageKind::DataNotFound,
            MessageBody::DataFound { .. } => MessageKind::DataFound,
            MessageBody::RouteNotFound { .. } => MessageKind::RouteNotFound,
            MessageBody::SskDataFoundHeaders { .. } => MessageKind::SskDataFoundHeaders,
            MessageBody::SskDataFoundData { .. } => MessageKind::SskDataFoundData,
            MessageBody::SskPubKey { .. } => MessageKind::SskPubKey,
            MessageBody::SskPubKeyAccepted => MessageKind::SskPubKeyAccepted,
            MessageBody::DataInsert { .. } => MessageKind::DataInsert,
            MessageBody::SskInsertRequestHeaders { .. } => MessageKind::SskInsertRequestHeaders,
            MessageBody::SskInsertRequestData { .. } => MessageKind::SskInsertRequestData,
            MessageBody::InsertReply => MessageKind::InsertReply,
            MessageBody::RejectedTimeout => MessageKind::RejectedTimeout,
            MessageBody::DataInsertRejected { .. } => MessageKind::DataInsertRejected,
            MessageBody::InsertTransfersCompleted { .. } => MessageKind::InsertTransfersCompleted,
            MessageBody::Packet { .. } => MessageKind::Packet,
            MessageBody::SendAborted { .. } => MessageKind::SendAborted,
        }
    }
}

const KIND_TAGS: [(MessageKind, &str); 24] = [
    (MessageKind::ChkDataRequest, "get"),
    (MessageKind::SskDataRequest, "sget"),
    (MessageKind::InsertRequest, "put"),
    (MessageKind::SskInsertRequest, "sput"),
    (MessageKind::Accepted, "acc"),
    (MessageKind::SskAccepted, "sacc"),
    (MessageKind::RejectedLoop, "loop"),
    (MessageKind::RejectedOverload, "ovl"),
    (MessageKind::DataNotFound, "dnf"),
    (MessageKind::DataFound, "df"),
    (MessageKind::RouteNotFound, "rnf"),
    (MessageKind::SskDataFoundHeaders, "sdfh"),
    (MessageKind::SskDataFoundData, "sdfd"),
    (MessageKind::SskPubKey, "pk"),
    (MessageKind::SskPubKeyAccepted, "pka"),
    (MessageKind::DataInsert, "di"),
    (MessageKind::SskInsertRequestHeaders, "sih"),
    (MessageKind::SskInsertRequestData, "sid"),
    (MessageKind::InsertReply, "ir"),
    (MessageKind::RejectedTimeout, "rto"),
    (MessageKind::DataInsertRejected, "dir"),
    (MessageKind::InsertTransfersCompleted, "itc"),
    (MessageKind::Packet, "pkt"),
    (MessageKind::SendAborted, "abrt"),
];

impl MessageKind {
    /// Value of the `y` key on the wire.
    pub fn tag(&self) -> &'static str {
        KIND_TAGS
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, tag)| *tag)
            .unwrap_or("?")
    }

    pub fn from_tag(tag: &str) -> Option<MessageKind> {
        KIND_TAGS
            .iter()
            .find(|(_, t)| *t == tag)
            .map(|(kind, _)| *kind)
    }
}

impl RejectReason {
    pub fn code(&self) -> i64 {
        match self {
            RejectReason::VerifyFailed => 1,
            RejectReason::ReceiveFailed => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<RejectReason> {
        match code {
            1 => Some(RejectReason::VerifyFailed),
            2 => Some(RejectReason::ReceiveFailed),
            _ => None,
        }
    }
}

impl AbortReason {
    pub fn code(&self) -> i64 {
        match self {
            AbortReason::Timeout => 1,
            AbortReason::Disconnected => 2,
            AbortReason::SenderAborted => 3,
            AbortReason::UpstreamFailed => 4,
            AbortReason::Cancelled => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<AbortReason> {
        match code {
            1 => Some(AbortReason::Timeout),
            2 => Some(AbortReason::Disconnected),
            3 => Some(AbortReason::SenderAborted),
            4 => Some(AbortReason::UpstreamFailed),
            5 => Some(AbortReason::Cancelled),
            _ => None,
        }
    }
}

// === Wire helpers ===

fn set_ssk_key(wire: &mut WireMessage, key: &SskKey) {
    wire.pubkey_hash = Some(ByteBuf::from(key.pubkey_hash.to_vec()));
    wire.doc_hash = Some(ByteBuf::from(key.doc_hash.to_vec()));
}

fn htl(wire: &WireMessage) -> Result<Htl> {
    wire.htl
        .and_then(|htl| Htl::try_from(htl).ok())
        .ok_or(Error::InvalidMessage("missing or invalid htl"))
}

fn target(wire: &WireMessage) -> Result<Location> {
    Location::from_bytes(
        wire.target
            .as_deref()
            .ok_or(Error::InvalidMessage("missing target"))?,
    )
}

fn chk_key(wire: &WireMessage) -> Result<ChkKey> {
    let key = wire.key.as_deref().ok_or(Error::InvalidMessage("missing key"))?;

    Ok(ChkKey(Id::from_bytes(key)?))
}

fn ssk_key(wire: &WireMessage) -> Result<SskKey> {
    let pubkey_hash = wire
        .pubkey_hash
        .as_deref()
        .ok_or(Error::InvalidMessage("missing pubkey hash"))?;
    let doc_hash = wire
        .doc_hash
        .as_deref()
        .ok_or(Error::InvalidMessage("missing document hash"))?;

    Ok(SskKey {
        pubkey_hash: Id::from_bytes(pubkey_hash)?,
        doc_hash: Id::from_bytes(doc_hash)?,
    })
}

fn headers(wire: &WireMessage) -> Result<Bytes> {
    wire.headers
        .as_deref()
        .map(|bytes| Bytes::copy_from_slice(bytes))
        .ok_or(Error::InvalidMessage("missing headers"))
}

fn data(wire: &WireMessage) -> Result<Bytes> {
    wire.data
        .as_deref()
        .map(|bytes| Bytes::copy_from_slice(bytes))
        .ok_or(Error::InvalidMessage("missing data"))
}

fn flag(wire: &WireMessage) -> Result<bool> {
    match wire.flag {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(Error::InvalidMessage("missing or invalid flag")),
    }
}

fn reason(wire: &WireMessage) -> Result<i64> {
    wire.reason.ok_or(Error::InvalidMessage("missing reason"))
}
