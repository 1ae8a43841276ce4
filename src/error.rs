//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Keyroute crate error enum.
pub enum Error {
    #[error("Failed to parse message bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Indicates that an [crate::Id] was built from the wrong number of bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Indicates that a ring position is outside `[0, 1)`.
    #[error("Invalid location: {0}")]
    InvalidLocation(f64),

    /// Indicates that a decoded message is missing a field, or carries a malformed one.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Indicates that a block payload does not match the configured block geometry.
    #[error("Invalid block size, expected {expected} bytes, got {got}")]
    InvalidBlockSize { expected: usize, got: usize },

    /// Indicates that the [crate::NodeBuilder] requires more information.
    #[error("{0} is required")]
    BuilderMissingFieldError(&'static str),
}

/// Alias for `Result<T, keyroute::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
