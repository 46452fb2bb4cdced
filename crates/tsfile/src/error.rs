//! Error and Result types for container operations.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` type for container operations.
pub type Result<T> = std::result::Result<T, TsFileError>;

/// The error type for container operations.
#[derive(Debug, Error)]
pub enum TsFileError {
    /// Invalid magic bytes in the container preamble or tail.
    #[error("Invalid magic bytes: expected ATSF, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported container format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Stored checksum does not match the bytes it covers.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// A structure read by the reader is not well-formed.
    #[error("Corrupted container: {0}")]
    Corrupted(String),

    /// The writer was asked to emit a chunk group it cannot encode.
    #[error("Invalid chunk group: {0}")]
    InvalidChunkGroup(String),

    /// A sealed container was reopened for appending.
    #[error("Container {0} is sealed and cannot be reopened for writing")]
    SealedReopen(PathBuf),

    /// An earlier write failed part-way, so the writer no longer knows where
    /// its bytes end.
    #[error("Writer for {0} failed earlier and rejects further writes")]
    WriterPoisoned(PathBuf),

    /// The container carries no closing metadata.
    #[error("Container {0} is not sealed")]
    NotSealed(PathBuf),

    /// A flush sub-operation reported failure.
    #[error("Flush failed: {0}")]
    FlushFailed(String),

    /// A flush sub-operation did not finish in time.
    #[error("Flush timed out after {0:?}")]
    FlushTimeout(Duration),

    /// A flush sub-operation was cancelled before it produced a result.
    #[error("Flush was cancelled")]
    FlushCancelled,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// Reasons a single token could not be decoded from the byte stream.
///
/// `Incomplete`, `Invalid` and `ChecksumMismatch` are resolved by the
/// recovery scanner (it stops and keeps the last confirmed prefix); only `Io`
/// reaches its caller.
#[derive(Debug, Error)]
pub enum TokenError {
    /// A declared length runs past the end of the stream.
    #[error("Incomplete token: needed {needed} bytes, {available} available")]
    Incomplete {
        /// Bytes the token declares it needs.
        needed: u64,
        /// Bytes actually left in the stream.
        available: u64,
    },

    /// The token's fields contradict each other or the format.
    #[error("Invalid token: {0}")]
    Invalid(String),

    /// A checksummed body does not match its stored CRC32.
    #[error("{what} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The structure whose body was checked.
        what: String,
        /// Stored CRC32 checksum.
        expected: u32,
        /// CRC32 computed over the bytes read.
        actual: u32,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result of decoding a single token.
pub type TokenResult<T> = std::result::Result<T, TokenError>;
