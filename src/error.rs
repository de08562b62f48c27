//! Library-wide error and result types.

use std::io;

use thiserror::Error;

/// Result alias used throughout nxkeys.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors the library can produce.
///
/// Key file loading never fails because of a single bad line; those
/// conditions are reported through [`crate::ProgressReport`] and skipped.
/// The variants below surface from the name-based accessors and from I/O.
#[derive(Debug, Error)]
pub enum Error {
    /// A structural constraint was violated (message describes which one).
    #[error("parse error: {0}")]
    Parse(&'static str),
    /// The key name is not part of the key catalog.
    #[error("unknown key: {0}")]
    UnknownKey(String),
    /// The value does not match the size of the named key slot.
    #[error("key {name} had incorrect size {actual} (expected {expected})")]
    InvalidKeySize {
        /// Catalog name of the key.
        name: String,
        /// Slot size in bytes.
        expected: usize,
        /// Decoded value size in bytes.
        actual: usize,
    },
    /// A value was not a valid hexadecimal string.
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    /// An underlying I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
