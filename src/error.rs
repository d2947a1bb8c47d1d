//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns one of these variants,
//! synchronously, with no partial-state mutation on failure.

use std::fmt;

/// Every error kind the core engine can surface.
#[derive(Debug)]
pub enum Error {
    /// Null/empty/out-of-range argument.
    InvalidArgument(&'static str),
    /// Path component, feature, block index, or cache entry not found.
    NotFound,
    /// Duplicate child name or duplicate feature GUID.
    AlreadyExists,
    /// Operation not allowed in the image's current mode (read vs write).
    PermissionDenied,
    /// Path resolution expected a directory and found something else.
    NotADirectory,
    /// Path resolution expected a file/symlink and found a directory.
    IsADirectory,
    /// Block CRC mismatch, or a malformed descriptor (length shorter than
    /// the base, or an unknown type tag).
    IntegrityError,
    /// A device's exclusive-access primitive is already held.
    Contention,
    /// Allocation failure.
    OutOfMemory,
    /// The underlying device failed to read or write.
    IoError(std::io::Error),
    /// The storage backend lacks a required operation for this mode
    /// (e.g. write on a read-only ops backend).
    Unsupported(&'static str),
    /// A path token exceeded the name-length limit.
    NameTooLong,
    /// Symlink resolution exceeded `MAX_SYMLINK_DEPTH`.
    TooManyLinks,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotFound => write!(f, "not found"),
            Error::AlreadyExists => write!(f, "already exists"),
            Error::PermissionDenied => write!(f, "permission denied"),
            Error::NotADirectory => write!(f, "not a directory"),
            Error::IsADirectory => write!(f, "is a directory"),
            Error::IntegrityError => write!(f, "integrity error: CRC mismatch or malformed descriptor"),
            Error::Contention => write!(f, "device exclusive-access already held"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::IoError(e) => write!(f, "I/O error: {e}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Error::NameTooLong => write!(f, "name exceeds the maximum length"),
            Error::TooManyLinks => write!(f, "too many levels of symbolic links"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e)
    }
}
