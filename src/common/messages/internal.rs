use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Bencode dictionary every message travels as. Fields that a kind does not use are
/// left out of the encoding.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WireMessage {
    #[serde(rename = "y")]
    pub kind: String,

    #[serde(rename = "u", with = "serde_bytes")]
    pub uid: Vec<u8>,

    #[serde(default, rename = "h", skip_serializing_if = "Option::is_none")]
    pub htl: Option<i64>,

    #[serde(default, rename = "l", skip_serializing_if = "Option::is_none")]
    /// Ring position, big endian f64 bits.
    pub target: Option<ByteBuf>,

    #[serde(default, rename = "k", skip_serializing_if = "Option::is_none")]
    pub key: Option<ByteBuf>,

    #[serde(default, rename = "p", skip_serializing_if = "Option::is_none")]
    pub pubkey_hash: Option<ByteBuf>,

    #[serde(default, rename = "d", skip_serializing_if = "Option::is_none")]
    pub doc_hash: Option<ByteBuf>,

    #[serde(default, rename = "hd", skip_serializing_if = "Option::is_none")]
    pub headers: Option<ByteBuf>,

    #[serde(default, rename = "v", skip_serializing_if = "Option::is_none")]
    pub data: Option<ByteBuf>,

    #[serde(default, rename = "pk", skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<ByteBuf>,

    #[serde(default, rename = "f", skip_serializing_if = "Option::is_none")]
    /// Boolean carried by some kinds, as bencode has no booleans.
    pub flag: Option<i32>,

    #[serde(default, rename = "i", skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,

    #[serde(default, rename = "r", skip_serializing_if = "Option::is_none")]
    pub reason: Option<i64>,
}

impl WireMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}
