//! Miscellaneous common structs used throughout the library.

mod block;
mod htl;
mod id;
mod immutable;
mod key;
pub mod messages;
mod mutable;
mod peer;

pub use block::*;
pub use htl::*;
pub use id::*;
pub use immutable::*;
pub use key::*;
pub use messages::*;
pub use mutable::*;
pub use peer::*;
