//! Identifiers: routing keys, chain UIDs and positions on the keyspace ring.
use rand::Rng;
use sha1_smol::Sha1;
use std::fmt::{self, Debug, Display, Formatter};

use crate::{Error, Result};

/// The size of routing keys and hashes in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// A 160 bit hash: a CHK, an SSK routing key, or a public key hash.
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; 20] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// SHA-1 of the concatenation of `parts`.
    pub fn hash(parts: &[&[u8]]) -> Id {
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part);
        }

        Id(hasher.digest().bytes())
    }

    /// The position of this key on the keyspace ring.
    pub fn location(&self) -> Location {
        Location::from_id(self)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let hex_chars: String = self.0.iter().map(|byte| format!("{:02x}", byte)).collect();

        write!(f, "{}", hex_chars)
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Random 64 bit identifier shared by every hop of one request or insert chain.
pub struct Uid(pub u64);

impl Uid {
    pub fn random() -> Uid {
        Uid(rand::thread_rng().gen())
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Uid> {
        let bytes: [u8; 8] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| Error::InvalidMessage("uid must be 8 bytes"))?;

        Ok(Uid(u64::from_be_bytes(bytes)))
    }
}

impl Display for Uid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Debug for Uid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self)
    }
}

#[derive(Clone, Copy, PartialEq, PartialOrd, Default)]
/// A point on the keyspace ring, in `[0, 1)`.
pub struct Location(f64);

impl Location {
    /// Create a location, returns Err if `value` is not a finite number in `[0, 1)`.
    pub fn new(value: f64) -> Result<Location> {
        if !(0.0..1.0).contains(&value) {
            return Err(Error::InvalidLocation(value));
        }

        Ok(Location(value))
    }

    pub fn random() -> Location {
        Location(rand::thread_rng().gen_range(0.0..1.0))
    }

    /// Map a routing key onto the ring using its 53 most significant bits.
    pub fn from_id(id: &Id) -> Location {
        let mut head = [0; 8];
        head.copy_from_slice(&id.0[..8]);
        let bits = u64::from_be_bytes(head) >> 11;

        Location(bits as f64 / (1u64 << 53) as f64)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Circular distance between two locations, in `[0, 0.5]`.
    pub fn distance(&self, other: Location) -> f64 {
        let d = (self.0 - other.0).abs();

        d.min(1.0 - d)
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_bits().to_be_bytes()
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Location> {
        let bytes: [u8; 8] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| Error::InvalidMessage("target must be 8 bytes"))?;

        Location::new(f64::from_bits(u64::from_be_bytes(bytes)))
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

impl Debug for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Location({})", self)
    }
}
