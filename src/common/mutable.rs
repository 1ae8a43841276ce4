//! Helper functions and structs for signed subspace blocks.

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use super::{Id, SskKey, VerifyError};

/// Size of an SSK block's headers: the ed25519 signature.
pub const SSK_HEADERS_SIZE: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
/// A mutable block, signed by the owner of its subspace.
///
/// The first validly signed block stored under a key wins; a node that already holds a
/// different block answers inserts with the one it has.
pub struct SskBlock {
    key: SskKey,
    /// ed25519 public key
    pubkey: [u8; 32],
    /// ed25519 signature over the routing key and data
    signature: [u8; 64],
    data: Bytes,
}

impl SskBlock {
    /// Sign `data` as the document `doc_name` in the subspace of `signer`.
    pub fn new(signer: &SigningKey, doc_name: &[u8], data: &[u8]) -> Self {
        let pubkey = signer.verifying_key().to_bytes();
        let key = SskKey::new(&pubkey, doc_name);
        let signable = encode_signable(&key.routing_key(), data);
        let signature = signer.sign(&signable);

        Self {
            key,
            pubkey,
            signature: signature.to_bytes(),
            data: Bytes::copy_from_slice(data),
        }
    }

    /// Rebuild a block received from a peer, checking the public key and signature.
    pub fn verify(
        key: &SskKey,
        headers: &[u8],
        data: Bytes,
        pubkey: &[u8; 32],
    ) -> Result<Self, VerifyError> {
        if !key.matches_pubkey(pubkey) {
            return Err(VerifyError::PubKeyMismatch);
        }

        let signature: [u8; SSK_HEADERS_SIZE] = headers
            .try_into()
            .map_err(|_| VerifyError::InvalidHeaders)?;

        let verifying_key =
            VerifyingKey::from_bytes(pubkey).map_err(|_| VerifyError::InvalidPubKey)?;

        verifying_key
            .verify(
                &encode_signable(&key.routing_key(), &data),
                &Signature::from_bytes(&signature),
            )
            .map_err(|_| VerifyError::InvalidSignature)?;

        Ok(Self {
            key: *key,
            pubkey: *pubkey,
            signature,
            data,
        })
    }

    // === Getters ===

    pub fn key(&self) -> &SskKey {
        &self.key
    }

    pub fn pubkey(&self) -> &[u8; 32] {
        &self.pubkey
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    /// Headers as they travel on the wire.
    pub fn headers(&self) -> Bytes {
        Bytes::copy_from_slice(&self.signature)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

pub fn encode_signable(routing_key: &Id, data: &[u8]) -> Box<[u8]> {
    let mut signable = vec![];

    signable.extend(b"1:k20:");
    signable.extend(routing_key.as_bytes());
    signable.extend(format!("1:v{}:", data.len()).into_bytes());
    signable.extend(data);

    signable.into()
}
