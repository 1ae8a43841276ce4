//! Blocks of either key type.

use bytes::Bytes;

use super::{ChkBlock, Key, SskBlock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Chk(ChkBlock),
    Ssk(SskBlock),
}

impl Block {
    pub fn key(&self) -> Key {
        match self {
            Block::Chk(block) => Key::Chk(*block.key()),
            Block::Ssk(block) => Key::Ssk(*block.key()),
        }
    }

    pub fn data(&self) -> &Bytes {
        match self {
            Block::Chk(block) => block.data(),
            Block::Ssk(block) => block.data(),
        }
    }
}

impl From<ChkBlock> for Block {
    fn from(block: ChkBlock) -> Self {
        Block::Chk(block)
    }
}

impl From<SskBlock> for Block {
    fn from(block: SskBlock) -> Self {
        Block::Ssk(block)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Reasons a received block is rejected.
pub enum VerifyError {
    #[error("Block content does not hash to its key")]
    HashMismatch,

    #[error("Public key does not hash to the key's public key hash")]
    PubKeyMismatch,

    #[error("Invalid public key")]
    InvalidPubKey,

    #[error("Malformed block headers")]
    InvalidHeaders,

    #[error("Invalid block signature")]
    InvalidSignature,
}
