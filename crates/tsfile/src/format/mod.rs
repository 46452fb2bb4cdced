//! Container file format.
//!
//! A container is a fixed preamble followed by self-describing tokens, each
//! introduced by a one-byte [`MetaMarker`]:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Preamble (8 bytes)                                          │
//! │  - Magic: "ATSF" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Reserved: 2 bytes                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Chunk groups (repeated)                                     │
//! │  - 0x01 chunk header + pages (one per measurement)           │
//! │  - 0x00 chunk group footer (device id, size, chunk count)    │
//! │  - 0x02 separator (optional commit point)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Closing metadata (sealed containers only)                   │
//! │  - 0x03 marker, device index body                            │
//! │  - Tail: body size, body CRC32, reverse magic "FSTA"         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

pub mod chunk;
pub mod metadata;
pub mod token;

pub use chunk::{Chunk, ChunkGroupFooter, ChunkHeader, Page, PageHeader};
pub use metadata::{ChunkGroupMetadata, ChunkMetadata, DeviceIndex, FileMetadata};
pub use token::{Token, TokenReader};

use crate::error::{Result, TsFileError};
use std::io::Write;

/// Timestamp in nanoseconds since the Unix epoch.
pub type Timestamp = i64;

/// Magic bytes at the start of every container: "ATSF"
pub const MAGIC: [u8; 4] = *b"ATSF";

/// Reverse magic bytes closing a sealed container: "FSTA"
pub const MAGIC_REVERSE: [u8; 4] = *b"FSTA";

/// Current container format version.
pub const FORMAT_VERSION: u16 = 1;

/// Preamble size in bytes.
pub const PREAMBLE_SIZE: usize = 8;

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 28;

/// Size of the fixed tail after the closing metadata body.
pub const CLOSING_TAIL_SIZE: usize = 12;

/// One-byte markers introducing each token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaMarker {
    /// Terminates the chunks written for one device.
    ChunkGroupFooter = 0,
    /// Starts a chunk (header followed by its pages).
    ChunkHeader = 1,
    /// Payload-free commit point confirming the preceding footer.
    Separator = 2,
    /// Starts the closing metadata of a sealed container.
    ClosingMetadata = 3,
}

impl MetaMarker {
    /// Creates a MetaMarker from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ChunkGroupFooter),
            1 => Some(Self::ChunkHeader),
            2 => Some(Self::Separator),
            3 => Some(Self::ClosingMetadata),
            _ => None,
        }
    }

    /// Writes the marker byte.
    pub fn write_to<W: Write>(self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self as u8])?;
        Ok(())
    }
}

/// Data type of the values stored in a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DataType {
    /// Boolean values.
    Boolean = 0,
    /// 32-bit signed integers.
    Int32 = 1,
    /// 64-bit signed integers.
    Int64 = 2,
    /// 32-bit floats.
    Float = 3,
    /// 64-bit floats.
    #[default]
    Double = 4,
    /// UTF-8 text.
    Text = 5,
}

impl DataType {
    /// Creates a DataType from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Boolean),
            1 => Some(Self::Int32),
            2 => Some(Self::Int64),
            3 => Some(Self::Float),
            4 => Some(Self::Double),
            5 => Some(Self::Text),
            _ => None,
        }
    }
}

/// Value encoding recorded in a chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Encoding {
    /// Values stored as-is.
    #[default]
    Plain = 0,
    /// Run-length encoding.
    Rle = 1,
    /// Second-order delta encoding.
    Ts2Diff = 2,
    /// Gorilla XOR encoding.
    Gorilla = 3,
}

impl Encoding {
    /// Creates an Encoding from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Plain),
            1 => Some(Self::Rle),
            2 => Some(Self::Ts2Diff),
            3 => Some(Self::Gorilla),
            _ => None,
        }
    }
}

/// Compression codec recorded in a chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    /// No compression.
    #[default]
    Uncompressed = 0,
    /// Snappy.
    Snappy = 1,
    /// Gzip.
    Gzip = 2,
    /// LZ4.
    Lz4 = 3,
}

impl Compression {
    /// Creates a Compression from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Uncompressed),
            1 => Some(Self::Snappy),
            2 => Some(Self::Gzip),
            3 => Some(Self::Lz4),
            _ => None,
        }
    }
}

/// Container preamble (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// Format version the container was written with.
    pub version: u16,
}

impl Default for Preamble {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
        }
    }
}

impl Preamble {
    /// Creates a preamble for the current format version.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the preamble using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        // Magic (4 bytes)
        writer.write_all(&MAGIC)?;
        // Version (2 bytes)
        writer.write_all(&self.version.to_le_bytes())?;
        // Reserved (2 bytes)
        writer.write_all(&[0u8; 2])?;
        Ok(())
    }

    /// Decodes a complete preamble.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::InvalidMagic` if the magic bytes don't match.
    /// Returns `TsFileError::UnsupportedVersion` if the version is newer than this crate.
    pub fn from_bytes(buf: &[u8; PREAMBLE_SIZE]) -> Result<Self> {
        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(TsFileError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version == 0 || version > FORMAT_VERSION {
            return Err(TsFileError::UnsupportedVersion(version));
        }

        Ok(Self { version })
    }

    /// Checks that a preamble shorter than its fixed size could still be the
    /// start of one written by this crate.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::InvalidMagic` if the bytes present disagree with
    /// the magic, and `TsFileError::UnsupportedVersion` if a complete version
    /// field is out of range.
    pub fn check_prefix(buf: &[u8]) -> Result<()> {
        let magic_len = buf.len().min(MAGIC.len());
        if buf[..magic_len] != MAGIC[..magic_len] {
            let mut magic = [0u8; 4];
            magic[..magic_len].copy_from_slice(&buf[..magic_len]);
            return Err(TsFileError::InvalidMagic(magic));
        }

        if buf.len() >= 6 {
            let version = u16::from_le_bytes([buf[4], buf[5]]);
            if version == 0 || version > FORMAT_VERSION {
                return Err(TsFileError::UnsupportedVersion(version));
            }
        } else if buf.len() == 5 && buf[4] == 0 {
            // A zero low byte means version 0 or at least 256.
            return Err(TsFileError::UnsupportedVersion(0));
        }

        Ok(())
    }
}
