//! # Error Taxonomy
//!
//! A closed set of failure kinds returned synchronously by every validation
//! and lifecycle operation in the broker core. Names are semantic; a real
//! ioctl dispatcher sitting in front of this core would map each variant to
//! a fixed host-ABI errno, but that mapping is the dispatcher's job, not
//! this crate's.
//!
//! No operation in this crate partially links an object before returning an
//! error: either a `Result::Ok` carries a fully linked, observable object,
//! or nothing changed.

use thiserror::Error;

/// A broker core failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// User buffer unreadable (in this in-process core: the caller-provided
    /// slice was shorter than its own declared size).
    #[error("user buffer unreadable")]
    BadAddress,

    /// Declared size exceeds the fixed ceiling (64 KiB - 1 for commands).
    #[error("declared size too large")]
    TooLarge,

    /// Declared size is below the fixed header for its record kind.
    #[error("declared size too small")]
    TooSmall,

    /// Malformed item: empty payload, misaligned/out-of-range bloom_size,
    /// a string missing its NUL terminator, a duplicate singleton item, or
    /// excess trailing bytes at the end of a stream.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A name item's payload exceeded the length this record kind allows.
    #[error("name too long")]
    NameTooLong,

    /// An item type or host facility is not recognized/available.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Duplicate sibling name (namespace, bus) or duplicate singleton item.
    #[error("already exists")]
    AlreadyExists,

    /// Bus name prefix does not match the caller's uid.
    #[error("permission denied")]
    PermissionDenied,

    /// Allocation failed.
    #[error("no memory")]
    NoMemory,

    /// A required item was missing once the stream was fully parsed.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// Operation attempted on an object after it was disconnected.
    #[error("shut down")]
    Shutdown,

    /// `send` exceeded its caller-supplied timeout.
    #[error("timed out")]
    TimedOut,
}

pub type Result<T> = std::result::Result<T, Error>;
