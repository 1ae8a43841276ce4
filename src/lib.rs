#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;

mod error;
mod node;
pub mod routing;
pub mod rpc;
pub mod server;
#[cfg(feature = "testnet")]
mod testnet;

pub use crate::common::{
    messages, Block, ChkBlock, ChkKey, Htl, HtlCoins, Id, Key, Location, Message, MessageBody,
    PeerHandle, PeerId, SskBlock, SskKey, Uid, VerifyError,
};
pub use bytes::Bytes;
pub use error::{Error, Result};
pub use node::{GetError, Node, NodeBuilder, PutError, PutOptions};
#[cfg(feature = "testnet")]
pub use testnet::Testnet;

pub use ed25519_dalek::SigningKey;
