//! Chunks, pages and chunk-group footers.
//!
//! ## Chunk Binary Layout
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    1       marker (0x01)
//! 0x01    2       measurement_id_len (u16 LE)
//! 0x03    L       measurement_id (UTF-8)
//! 0x03+L  4       data_size (u32 LE, bytes of all pages below)
//! 0x07+L  4       num_pages (u32 LE)
//! 0x0B+L  1       data_type (u8)
//! 0x0C+L  1       encoding (u8)
//! 0x0D+L  1       compression (u8)
//! 0x0E+L  ...     pages[num_pages]
//! ```
//!
//! Each page is a 28-byte [`PageHeader`] followed by `body_size` opaque bytes.

use crate::error::{Result, TsFileError};
use crate::format::{
    Compression, DataType, Encoding, MetaMarker, Timestamp, PAGE_HEADER_SIZE,
};
use std::io::Write;

/// Header preceding every page body (28 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    /// Number of values encoded in the page.
    pub num_values: u32,
    /// Minimum timestamp in the page.
    pub min_timestamp: Timestamp,
    /// Maximum timestamp in the page.
    pub max_timestamp: Timestamp,
    /// Size of the page body in bytes.
    pub body_size: u32,
    /// CRC32 checksum of the page body.
    pub body_crc32: u32,
}

impl PageHeader {
    /// Writes the header using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.num_values.to_le_bytes())?;
        writer.write_all(&self.min_timestamp.to_le_bytes())?;
        writer.write_all(&self.max_timestamp.to_le_bytes())?;
        writer.write_all(&self.body_size.to_le_bytes())?;
        writer.write_all(&self.body_crc32.to_le_bytes())?;
        Ok(())
    }

    /// Decodes a header from its fixed-size byte form.
    pub fn from_bytes(buf: &[u8; PAGE_HEADER_SIZE]) -> Self {
        let mut b4 = [0u8; 4];
        let mut b8 = [0u8; 8];

        b4.copy_from_slice(&buf[0..4]);
        let num_values = u32::from_le_bytes(b4);
        b8.copy_from_slice(&buf[4..12]);
        let min_timestamp = i64::from_le_bytes(b8);
        b8.copy_from_slice(&buf[12..20]);
        let max_timestamp = i64::from_le_bytes(b8);
        b4.copy_from_slice(&buf[20..24]);
        let body_size = u32::from_le_bytes(b4);
        b4.copy_from_slice(&buf[24..28]);
        let body_crc32 = u32::from_le_bytes(b4);

        Self {
            num_values,
            min_timestamp,
            max_timestamp,
            body_size,
            body_crc32,
        }
    }
}

/// A length-delimited block of encoded values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Page header.
    pub header: PageHeader,
    /// Encoded values. Opaque to the container.
    pub body: Vec<u8>,
}

impl Page {
    /// Creates a page over already-encoded values.
    pub fn new(
        num_values: u32,
        min_timestamp: Timestamp,
        max_timestamp: Timestamp,
        body: Vec<u8>,
    ) -> Self {
        Self {
            header: PageHeader {
                num_values,
                min_timestamp,
                max_timestamp,
                body_size: body.len() as u32,
                body_crc32: crc32fast::hash(&body),
            },
            body,
        }
    }

    /// Creates a plain-encoded page of `(timestamp, f64)` points.
    ///
    /// The body holds all timestamps followed by all values, 8 bytes each.
    pub fn from_points(points: &[(Timestamp, f64)]) -> Self {
        let mut body = Vec::with_capacity(points.len() * 16);
        for (ts, _) in points {
            body.extend_from_slice(&ts.to_le_bytes());
        }
        for (_, val) in points {
            body.extend_from_slice(&val.to_le_bytes());
        }

        let min_ts = points.iter().map(|(ts, _)| *ts).min().unwrap_or(0);
        let max_ts = points.iter().map(|(ts, _)| *ts).max().unwrap_or(0);
        Self::new(points.len() as u32, min_ts, max_ts, body)
    }

    /// Verifies the body against the header checksum.
    pub fn verify_crc(&self) -> bool {
        self.header.body_size as usize == self.body.len()
            && self.header.body_crc32 == crc32fast::hash(&self.body)
    }

    /// Returns the size of the page in bytes when serialized.
    pub fn serialized_size(&self) -> usize {
        PAGE_HEADER_SIZE + self.body.len()
    }

    /// Writes the page header and body.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.header.write_to(writer)?;
        writer.write_all(&self.body)?;
        Ok(())
    }
}

/// Describes one encoded measurement segment within a chunk group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Measurement (column) identifier.
    pub measurement_id: String,
    /// Declared byte length of all pages that follow.
    pub data_size: u32,
    /// Declared number of pages that follow.
    pub num_pages: u32,
    /// Data type of the values.
    pub data_type: DataType,
    /// Value encoding.
    pub encoding: Encoding,
    /// Compression codec.
    pub compression: Compression,
}

impl ChunkHeader {
    /// Writes the marker and header fields.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        MetaMarker::ChunkHeader.write_to(writer)?;

        let id = self.measurement_id.as_bytes();
        writer.write_all(&(id.len() as u16).to_le_bytes())?;
        writer.write_all(id)?;
        writer.write_all(&self.data_size.to_le_bytes())?;
        writer.write_all(&self.num_pages.to_le_bytes())?;
        writer.write_all(&[
            self.data_type as u8,
            self.encoding as u8,
            self.compression as u8,
        ])?;
        Ok(())
    }

    /// Returns the size of the header in bytes when serialized, marker included.
    pub fn serialized_size(&self) -> usize {
        1 + // marker
        2 + self.measurement_id.len() +
        4 + // data_size
        4 + // num_pages
        3 // data_type, encoding, compression
    }
}

/// A chunk header together with all of its pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk header.
    pub header: ChunkHeader,
    /// Pages in write order.
    pub pages: Vec<Page>,
}

impl Chunk {
    /// Creates a chunk, deriving the declared size and page count from `pages`.
    pub fn new(
        measurement_id: impl Into<String>,
        data_type: DataType,
        encoding: Encoding,
        compression: Compression,
        pages: Vec<Page>,
    ) -> Self {
        let data_size: usize = pages.iter().map(Page::serialized_size).sum();
        Self {
            header: ChunkHeader {
                measurement_id: measurement_id.into(),
                data_size: u32::try_from(data_size).unwrap_or(u32::MAX),
                num_pages: pages.len() as u32,
                data_type,
                encoding,
                compression,
            },
            pages,
        }
    }

    /// Creates a single-page, plain-encoded double chunk.
    pub fn from_points(measurement_id: impl Into<String>, points: &[(Timestamp, f64)]) -> Self {
        Self::new(
            measurement_id,
            DataType::Double,
            Encoding::Plain,
            Compression::Uncompressed,
            vec![Page::from_points(points)],
        )
    }

    /// Total number of values across all pages.
    pub fn num_values(&self) -> u64 {
        self.pages.iter().map(|p| p.header.num_values as u64).sum()
    }

    /// Minimum and maximum timestamp across all pages.
    pub fn time_range(&self) -> (Timestamp, Timestamp) {
        self.pages.iter().fold((i64::MAX, i64::MIN), |(min, max), p| {
            (
                min.min(p.header.min_timestamp),
                max.max(p.header.max_timestamp),
            )
        })
    }

    /// Checks that the header agrees with the pages it declares.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::InvalidChunkGroup` describing the first disagreement.
    pub fn validate(&self) -> Result<()> {
        let id = &self.header.measurement_id;
        if self.pages.is_empty() {
            return Err(TsFileError::InvalidChunkGroup(format!(
                "chunk {} has no pages",
                id
            )));
        }
        if id.len() > u16::MAX as usize {
            return Err(TsFileError::InvalidChunkGroup(format!(
                "measurement id of {} bytes is too long",
                id.len()
            )));
        }
        if self.header.num_pages as usize != self.pages.len() {
            return Err(TsFileError::InvalidChunkGroup(format!(
                "chunk {} declares {} pages, has {}",
                id,
                self.header.num_pages,
                self.pages.len()
            )));
        }
        let pages_size: usize = self.pages.iter().map(Page::serialized_size).sum();
        if self.header.data_size as usize != pages_size {
            return Err(TsFileError::InvalidChunkGroup(format!(
                "chunk {} declares {} data bytes, pages take {}",
                id, self.header.data_size, pages_size
            )));
        }
        for page in &self.pages {
            if !page.verify_crc() {
                return Err(TsFileError::InvalidChunkGroup(format!(
                    "chunk {} has a page whose body does not match its header",
                    id
                )));
            }
            if page.header.min_timestamp > page.header.max_timestamp {
                return Err(TsFileError::InvalidChunkGroup(format!(
                    "chunk {} has a page with an inverted time range",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Writes the header (marker included) followed by every page.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.header.write_to(writer)?;
        for page in &self.pages {
            page.write_to(writer)?;
        }
        Ok(())
    }

    /// Returns the size of the chunk in bytes when serialized, marker included.
    pub fn serialized_size(&self) -> usize {
        self.header.serialized_size() + self.header.data_size as usize
    }
}

/// Terminates the chunks written for one device.
///
/// ## Binary Layout
///
/// ```text
/// Offset  Size    Field
/// ------  ----    -----
/// 0x00    1       marker (0x00)
/// 0x01    2       device_id_len (u16 LE)
/// 0x03    L       device_id (UTF-8)
/// 0x03+L  8       data_size (u64 LE, first chunk marker to footer marker)
/// 0x0B+L  4       num_chunks (u32 LE)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGroupFooter {
    /// Device the group was written for.
    pub device_id: String,
    /// Bytes occupied by the group's chunks.
    pub data_size: u64,
    /// Number of chunks in the group.
    pub num_chunks: u32,
}

impl ChunkGroupFooter {
    /// Creates a new footer.
    pub fn new(device_id: impl Into<String>, data_size: u64, num_chunks: u32) -> Self {
        Self {
            device_id: device_id.into(),
            data_size,
            num_chunks,
        }
    }

    /// Writes the marker and footer fields.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        MetaMarker::ChunkGroupFooter.write_to(writer)?;

        let id = self.device_id.as_bytes();
        writer.write_all(&(id.len() as u16).to_le_bytes())?;
        writer.write_all(id)?;
        writer.write_all(&self.data_size.to_le_bytes())?;
        writer.write_all(&self.num_chunks.to_le_bytes())?;
        Ok(())
    }

    /// Returns the size of the footer in bytes when serialized, marker included.
    pub fn serialized_size(&self) -> usize {
        1 + 2 + self.device_id.len() + 8 + 4
    }
}
