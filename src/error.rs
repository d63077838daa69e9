//! Errors reported by the region operations.

use std::fmt;

use thiserror::Error;

use crate::details::Digest;
use crate::flash::FlashError;

/// The driver call that failed
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum DriverOp {
    Init,
    Read,
    Program,
    Erase,
}

impl fmt::Display for DriverOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriverOp::Init => "init",
            DriverOp::Read => "read",
            DriverOp::Program => "program",
            DriverOp::Erase => "erase",
        })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// The header could not be read, or it was rejected by the decoder
    #[error("firmware header is invalid")]
    HeaderInvalid,

    /// The payload does not hash to the recorded digest
    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: Digest, computed: Digest },

    /// The request would extend past the region; nothing was modified
    #[error("end address {end:#010x} exceeds region limit {limit:#010x}")]
    CapacityExceeded { end: u64, limit: u64 },

    /// A storage driver call failed on the byte range `start..end`
    #[error("{op} failed on {start:#010x}..{end:#010x}")]
    DriverFailure {
        op: DriverOp,
        start: u64,
        end: u64,
        #[source]
        source: FlashError,
    },

    /// The update source failed or returned no data
    #[error("update source read failed at offset {offset:#x}")]
    SourceReadFailure { offset: u64 },

    /// An asynchronous capability never signalled completion
    #[error("timed out waiting for completion")]
    Timeout,

    /// The build-time layout cannot work; this is not retryable
    #[error("configuration fault: {0}")]
    ConfigurationFault(String),
}

impl Error {
    /// Wrap a driver error with the operation and byte range it was issued for
    pub(crate) fn driver(op: DriverOp, start: u64, len: u64) -> impl FnOnce(FlashError) -> Self {
        move |source| Error::DriverFailure {
            op,
            start,
            end: start + len,
            source,
        }
    }
}
