//! Stable, loggable error taxonomy shared by the pool and the persistent store.
//!
//! Every fallible public operation returns [`Result<T>`]. Errors never unwind; the
//! taxonomy below is kept deliberately small and matches the kinds a caller needs to
//! make a retry/reroute decision on, not the underlying `std::io` detail (which is
//! still carried in the message for logs).

use std::fmt;

/// Crate-wide error kind.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The pool's free list was empty at allocation time.
    #[error("pool exhausted: out of memory")]
    OutOfMemory,

    /// An I/O, short-write, or on-disk consistency failure in the persistent store.
    ///
    /// The affected file descriptor has already been closed and the handle's error
    /// flag set, so the next operation on that handle will replay from the start of
    /// the current bucket.
    #[error("persistent store failure: {0}")]
    FailedStore(String),

    /// A lock or other OS primitive could not be created; terminal for the handle.
    #[error("OS primitive failure: {0}")]
    FailedOs(String),

    /// A blocking operation gave up within the caller's deadline. No state changed.
    #[error("operation timed out")]
    Timeout,

    /// The store table was full at `create`, or `relinquish` named a `sid` that is
    /// already relinquished (or otherwise not resident) in the addressed handle.
    /// A non-resident `sid` passed to `release` is reported as [`Error::FailedStore`]
    /// instead, since releasing a cache slot is a store-consistency concern rather
    /// than a handle/identifier-validity one.
    #[error("invalid store handle or storage id")]
    InvalidHandle,
}

impl Error {
    pub(crate) fn failed_store(context: impl fmt::Display) -> Self {
        Error::FailedStore(context.to_string())
    }

    pub(crate) fn failed_os(context: impl fmt::Display) -> Self {
        Error::FailedOs(context.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::FailedStore(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
