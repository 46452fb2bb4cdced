//! Token parser.
//!
//! [`TokenReader`] decodes exactly one structural unit per call from a
//! seekable byte source. Every declared length is checked against the bytes
//! actually left in the source before anything is read, so a truncated token
//! reports [`TokenError::Incomplete`] instead of allocating or blocking, and a
//! self-contradictory one reports [`TokenError::Invalid`]. Decoding depends on
//! nothing but the bytes.

use crate::error::{TokenError, TokenResult};
use crate::format::{
    Chunk, ChunkGroupFooter, ChunkGroupMetadata, ChunkHeader, ChunkMetadata, Compression,
    DataType, DeviceIndex, Encoding, FileMetadata, MetaMarker, Page, PageHeader,
    CLOSING_TAIL_SIZE, MAGIC_REVERSE, PAGE_HEADER_SIZE, PREAMBLE_SIZE,
};
use std::io::{self, Cursor, Read, Seek, SeekFrom};

/// One decoded token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// A chunk header with all of its pages.
    Chunk(Chunk),
    /// A chunk-group footer.
    ChunkGroupFooter(ChunkGroupFooter),
    /// A separator marker.
    Separator,
    /// The closing metadata of a sealed container.
    ClosingMetadata(FileMetadata),
}

impl Token {
    /// Returns the marker that introduced this token.
    pub fn marker(&self) -> MetaMarker {
        match self {
            Self::Chunk(_) => MetaMarker::ChunkHeader,
            Self::ChunkGroupFooter(_) => MetaMarker::ChunkGroupFooter,
            Self::Separator => MetaMarker::Separator,
            Self::ClosingMetadata(_) => MetaMarker::ClosingMetadata,
        }
    }
}

/// Sequential token decoder over a seekable byte source.
#[derive(Debug)]
pub struct TokenReader<R> {
    inner: R,
    position: u64,
    len: u64,
}

impl<R: Read + Seek> TokenReader<R> {
    /// Wraps a source, measuring its length and rewinding it to the start.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner,
            position: 0,
            len,
        })
    }

    /// Current offset from the start of the source.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total length of the source in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the source holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes left between the current position and the end of the source.
    pub fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.position)
    }

    /// Moves the cursor to an absolute offset.
    pub fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(())
    }

    /// Reads the raw preamble bytes at offset 0.
    pub fn read_preamble(&mut self) -> TokenResult<[u8; PREAMBLE_SIZE]> {
        self.seek_to(0)?;
        self.read_array::<PREAMBLE_SIZE>()
    }

    /// Reads whatever is present of a preamble cut short by the end of the
    /// source.
    pub fn read_preamble_prefix(&mut self) -> TokenResult<Vec<u8>> {
        self.seek_to(0)?;
        let len = self.len.min(PREAMBLE_SIZE as u64);
        self.read_vec(len)
    }

    /// Decodes the token starting at the current position.
    ///
    /// Returns `Ok(None)` when the cursor sits exactly at the end of the source.
    pub fn next_token(&mut self) -> TokenResult<Option<Token>> {
        if self.remaining() == 0 {
            return Ok(None);
        }

        let marker = self.read_u8()?;
        let token = match MetaMarker::from_u8(marker) {
            Some(MetaMarker::ChunkHeader) => Token::Chunk(self.read_chunk_body()?),
            Some(MetaMarker::ChunkGroupFooter) => {
                Token::ChunkGroupFooter(self.read_footer_body()?)
            }
            Some(MetaMarker::Separator) => Token::Separator,
            Some(MetaMarker::ClosingMetadata) => {
                Token::ClosingMetadata(self.read_closing_metadata()?)
            }
            None => {
                return Err(TokenError::Invalid(format!(
                    "unknown marker 0x{:02x} at offset {}",
                    marker,
                    self.position - 1
                )))
            }
        };
        Ok(Some(token))
    }

    /// Decodes the chunk whose marker sits at `offset`.
    pub fn read_chunk_at(&mut self, offset: u64) -> TokenResult<Chunk> {
        self.seek_to(offset)?;
        let marker = self.read_u8()?;
        if marker != MetaMarker::ChunkHeader as u8 {
            return Err(TokenError::Invalid(format!(
                "expected chunk header at offset {}, found marker 0x{:02x}",
                offset, marker
            )));
        }
        self.read_chunk_body()
    }

    /// Locates and decodes the closing metadata from the end of the source,
    /// without replaying any earlier token.
    pub fn read_closing_metadata_from_tail(&mut self) -> TokenResult<FileMetadata> {
        let min_len = (PREAMBLE_SIZE + 1 + CLOSING_TAIL_SIZE) as u64;
        if self.len < min_len {
            return Err(TokenError::Incomplete {
                needed: min_len,
                available: self.len,
            });
        }

        let tail_start = self.len - CLOSING_TAIL_SIZE as u64;
        self.seek_to(tail_start)?;
        let (body_size, body_crc) = self.read_tail()?;

        let body_start = tail_start
            .checked_sub(body_size as u64)
            .filter(|start| *start > PREAMBLE_SIZE as u64)
            .ok_or_else(|| {
                TokenError::Invalid(format!(
                    "closing metadata body of {} bytes does not fit in {} byte file",
                    body_size, self.len
                ))
            })?;

        self.seek_to(body_start - 1)?;
        let marker = self.read_u8()?;
        if marker != MetaMarker::ClosingMetadata as u8 {
            return Err(TokenError::Invalid(format!(
                "expected closing metadata marker at offset {}, found 0x{:02x}",
                body_start - 1,
                marker
            )));
        }

        self.read_metadata_body(body_size, body_crc)
    }

    /// Reads a chunk header (marker already consumed) and all of its pages.
    fn read_chunk_body(&mut self) -> TokenResult<Chunk> {
        let measurement_id = self.read_string("measurement id")?;
        let data_size = self.read_u32()?;
        let num_pages = self.read_u32()?;

        let raw_type = self.read_u8()?;
        let data_type = DataType::from_u8(raw_type)
            .ok_or_else(|| TokenError::Invalid(format!("unknown data type {}", raw_type)))?;
        let raw_encoding = self.read_u8()?;
        let encoding = Encoding::from_u8(raw_encoding)
            .ok_or_else(|| TokenError::Invalid(format!("unknown encoding {}", raw_encoding)))?;
        let raw_compression = self.read_u8()?;
        let compression = Compression::from_u8(raw_compression).ok_or_else(|| {
            TokenError::Invalid(format!("unknown compression {}", raw_compression))
        })?;

        if num_pages == 0 {
            return Err(TokenError::Invalid(format!(
                "chunk {} declares no pages",
                measurement_id
            )));
        }

        // The whole chunk must be present before any page is trusted.
        self.ensure(data_size as u64)?;

        let data_start = self.position;
        let data_end = data_start + data_size as u64;
        let mut pages = Vec::new();
        for page_no in 0..num_pages {
            if self.position + PAGE_HEADER_SIZE as u64 > data_end {
                return Err(TokenError::Invalid(format!(
                    "page {} of chunk {} overruns the declared {} data bytes",
                    page_no, measurement_id, data_size
                )));
            }
            let header = PageHeader::from_bytes(&self.read_array::<PAGE_HEADER_SIZE>()?);

            if self.position + header.body_size as u64 > data_end {
                return Err(TokenError::Invalid(format!(
                    "page {} of chunk {} overruns the declared {} data bytes",
                    page_no, measurement_id, data_size
                )));
            }
            if header.min_timestamp > header.max_timestamp {
                return Err(TokenError::Invalid(format!(
                    "page {} of chunk {} has min timestamp {} after max {}",
                    page_no, measurement_id, header.min_timestamp, header.max_timestamp
                )));
            }

            let body = self.read_vec(header.body_size as u64)?;
            let actual_crc = crc32fast::hash(&body);
            if actual_crc != header.body_crc32 {
                return Err(TokenError::ChecksumMismatch {
                    what: format!("page {} of chunk {}", page_no, measurement_id),
                    expected: header.body_crc32,
                    actual: actual_crc,
                });
            }

            pages.push(Page { header, body });
        }

        if self.position != data_end {
            return Err(TokenError::Invalid(format!(
                "pages of chunk {} cover {} of {} declared data bytes",
                measurement_id,
                self.position - data_start,
                data_size
            )));
        }

        Ok(Chunk {
            header: ChunkHeader {
                measurement_id,
                data_size,
                num_pages,
                data_type,
                encoding,
                compression,
            },
            pages,
        })
    }

    /// Reads a chunk-group footer (marker already consumed).
    fn read_footer_body(&mut self) -> TokenResult<ChunkGroupFooter> {
        let device_id = self.read_string("device id")?;
        if device_id.is_empty() {
            return Err(TokenError::Invalid(
                "chunk group footer with empty device id".to_string(),
            ));
        }
        let data_size = self.read_u64()?;
        let num_chunks = self.read_u32()?;

        Ok(ChunkGroupFooter {
            device_id,
            data_size,
            num_chunks,
        })
    }

    /// Reads the closing metadata (marker already consumed), which must run
    /// exactly to the end of the source.
    fn read_closing_metadata(&mut self) -> TokenResult<FileMetadata> {
        let body_start = self.position;
        self.ensure(CLOSING_TAIL_SIZE as u64)?;

        let tail_start = self.len - CLOSING_TAIL_SIZE as u64;
        self.seek_to(tail_start)?;
        let (body_size, body_crc) = self.read_tail()?;

        if body_start + body_size as u64 != tail_start {
            return Err(TokenError::Invalid(format!(
                "closing metadata declares {} body bytes, {} present",
                body_size,
                tail_start - body_start
            )));
        }

        self.seek_to(body_start)?;
        let metadata = self.read_metadata_body(body_size, body_crc)?;
        self.seek_to(self.len)?;
        Ok(metadata)
    }

    /// Reads body size, body checksum and reverse magic.
    fn read_tail(&mut self) -> TokenResult<(u32, u32)> {
        let body_size = self.read_u32()?;
        let body_crc = self.read_u32()?;
        let magic = self.read_array::<4>()?;
        if magic != MAGIC_REVERSE {
            return Err(TokenError::Invalid(format!(
                "closing metadata tail has magic {:?}",
                magic
            )));
        }
        Ok((body_size, body_crc))
    }

    fn read_metadata_body(&mut self, body_size: u32, expected_crc: u32) -> TokenResult<FileMetadata> {
        let body = self.read_vec(body_size as u64)?;
        let actual_crc = crc32fast::hash(&body);
        if actual_crc != expected_crc {
            return Err(TokenError::ChecksumMismatch {
                what: "closing metadata".to_string(),
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        let mut body_reader = TokenReader::new(Cursor::new(body))?;
        let index = body_reader.read_device_index()?;
        if body_reader.remaining() != 0 {
            return Err(TokenError::Invalid(format!(
                "{} trailing bytes in closing metadata",
                body_reader.remaining()
            )));
        }
        Ok(FileMetadata::new(index))
    }

    fn read_device_index(&mut self) -> TokenResult<DeviceIndex> {
        let mut index = DeviceIndex::new();

        let device_count = self.read_u32()?;
        for _ in 0..device_count {
            let device_id = self.read_string("device id")?;
            let group_count = self.read_u32()?;
            for _ in 0..group_count {
                let start_offset = self.read_u64()?;
                let end_offset = self.read_u64()?;
                if end_offset < start_offset {
                    return Err(TokenError::Invalid(format!(
                        "chunk group of {} ends at {} before its start {}",
                        device_id, end_offset, start_offset
                    )));
                }

                let chunk_count = self.read_u32()?;
                let mut chunks = Vec::new();
                for _ in 0..chunk_count {
                    chunks.push(self.read_chunk_metadata()?);
                }

                index.insert(ChunkGroupMetadata {
                    device_id: device_id.clone(),
                    start_offset,
                    end_offset,
                    chunks,
                });
            }
        }

        Ok(index)
    }

    fn read_chunk_metadata(&mut self) -> TokenResult<ChunkMetadata> {
        let measurement_id = self.read_string("measurement id")?;
        let offset = self.read_u64()?;
        let raw_type = self.read_u8()?;
        let data_type = DataType::from_u8(raw_type)
            .ok_or_else(|| TokenError::Invalid(format!("unknown data type {}", raw_type)))?;
        let num_values = self.read_u64()?;
        let start_time = self.read_i64()?;
        let end_time = self.read_i64()?;

        Ok(ChunkMetadata {
            measurement_id,
            offset,
            data_type,
            num_values,
            start_time,
            end_time,
        })
    }

    fn ensure(&self, needed: u64) -> TokenResult<()> {
        let available = self.remaining();
        if needed > available {
            return Err(TokenError::Incomplete { needed, available });
        }
        Ok(())
    }

    fn read_exact_checked(&mut self, buf: &mut [u8]) -> TokenResult<()> {
        let needed = buf.len() as u64;
        self.ensure(needed)?;
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.position += needed;
                Ok(())
            }
            // The source shrank underneath us.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TokenError::Incomplete {
                needed,
                available: self.remaining(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn read_array<const N: usize>(&mut self) -> TokenResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact_checked(&mut buf)?;
        Ok(buf)
    }

    fn read_vec(&mut self, len: u64) -> TokenResult<Vec<u8>> {
        self.ensure(len)?;
        let mut buf = vec![0u8; len as usize];
        self.read_exact_checked(&mut buf)?;
        Ok(buf)
    }

    fn read_u8(&mut self) -> TokenResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_u16(&mut self) -> TokenResult<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> TokenResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> TokenResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_i64(&mut self) -> TokenResult<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    fn read_string(&mut self, what: &str) -> TokenResult<String> {
        let len = self.read_u16()? as u64;
        let bytes = self.read_vec(len)?;
        String::from_utf8(bytes)
            .map_err(|e| TokenError::Invalid(format!("Invalid UTF-8 in {}: {}", what, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Preamble;

    fn reader(bytes: Vec<u8>) -> TokenReader<Cursor<Vec<u8>>> {
        TokenReader::new(Cursor::new(bytes)).unwrap()
    }

    fn chunk_bytes(chunk: &Chunk) -> Vec<u8> {
        let mut buf = Vec::new();
        chunk.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_empty_source_has_no_token() {
        let mut r = reader(Vec::new());
        assert!(r.is_empty());
        assert!(r.next_token().unwrap().is_none());
    }

    #[test]
    fn test_preamble_incomplete() {
        let mut r = reader(b"ATS".to_vec());
        assert!(matches!(
            r.read_preamble(),
            Err(TokenError::Incomplete { needed: 8, available: 3 })
        ));
    }

    #[test]
    fn test_preamble_read() {
        let mut buf = Vec::new();
        Preamble::new().write_to(&mut buf).unwrap();
        let mut r = reader(buf);
        let raw = r.read_preamble().unwrap();
        assert_eq!(Preamble::from_bytes(&raw).unwrap(), Preamble::new());
        assert_eq!(r.position(), PREAMBLE_SIZE as u64);
    }

    #[test]
    fn test_chunk_roundtrip() {
        let pages = vec![
            Page::from_points(&[(1, 1.0), (2, 2.0)]),
            Page::from_points(&[(3, 3.0)]),
        ];
        let chunk = Chunk::new("s1", DataType::Double, Encoding::Rle, Compression::Snappy, pages);
        let bytes = chunk_bytes(&chunk);
        let len = bytes.len() as u64;

        let mut r = reader(bytes);
        let token = r.next_token().unwrap().unwrap();
        assert_eq!(token.marker(), MetaMarker::ChunkHeader);
        assert_eq!(token, Token::Chunk(chunk));
        assert_eq!(r.position(), len);
        assert!(r.next_token().unwrap().is_none());
    }

    #[test]
    fn test_chunk_truncated_mid_page_is_incomplete() {
        let chunk = Chunk::from_points("s1", &[(1, 5.0), (2, 5.0)]);
        let mut bytes = chunk_bytes(&chunk);
        bytes.pop();

        let mut r = reader(bytes);
        assert!(matches!(
            r.next_token(),
            Err(TokenError::Incomplete { .. })
        ));
    }

    #[test]
    fn test_chunk_truncated_header_is_incomplete() {
        let chunk = Chunk::from_points("s1", &[(1, 5.0)]);
        let bytes = chunk_bytes(&chunk)[..3].to_vec();

        let mut r = reader(bytes);
        assert!(matches!(
            r.next_token(),
            Err(TokenError::Incomplete { .. })
        ));
    }

    #[test]
    fn test_chunk_page_checksum_mismatch() {
        let chunk = Chunk::from_points("s1", &[(1, 5.0)]);
        let mut bytes = chunk_bytes(&chunk);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let mut r = reader(bytes);
        assert!(matches!(
            r.next_token(),
            Err(TokenError::ChecksumMismatch { what, .. }) if what == "page 0 of chunk s1"
        ));
    }

    #[test]
    fn test_chunk_declared_size_disagrees_with_pages() {
        let mut chunk = Chunk::from_points("s1", &[(1, 5.0)]);
        let mut bytes = chunk_bytes(&chunk);
        // Declare one extra data byte and supply it.
        chunk.header.data_size += 1;
        let mut header = Vec::new();
        chunk.header.write_to(&mut header).unwrap();
        bytes[..header.len()].copy_from_slice(&header);
        bytes.push(0);

        let mut r = reader(bytes);
        assert!(matches!(r.next_token(), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn test_chunk_without_pages_is_invalid() {
        let chunk = Chunk::new(
            "s1",
            DataType::Double,
            Encoding::Plain,
            Compression::Uncompressed,
            Vec::new(),
        );
        let mut r = reader(chunk_bytes(&chunk));
        assert!(matches!(r.next_token(), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn test_footer_and_separator() {
        let mut bytes = Vec::new();
        ChunkGroupFooter::new("d1", 64, 1).write_to(&mut bytes).unwrap();
        MetaMarker::Separator.write_to(&mut bytes).unwrap();

        let mut r = reader(bytes);
        assert_eq!(
            r.next_token().unwrap(),
            Some(Token::ChunkGroupFooter(ChunkGroupFooter::new("d1", 64, 1)))
        );
        assert_eq!(r.next_token().unwrap(), Some(Token::Separator));
        assert_eq!(r.next_token().unwrap(), None);
    }

    #[test]
    fn test_unknown_marker() {
        let mut r = reader(vec![0x7F]);
        assert!(matches!(r.next_token(), Err(TokenError::Invalid(msg)) if msg.contains("0x7f")));
    }

    #[test]
    fn test_invalid_utf8_device_id() {
        let mut bytes = vec![MetaMarker::ChunkGroupFooter as u8];
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let mut r = reader(bytes);
        assert!(matches!(r.next_token(), Err(TokenError::Invalid(msg)) if msg.contains("UTF-8")));
    }

    fn sealed_image() -> (Vec<u8>, FileMetadata) {
        let mut bytes = Vec::new();
        Preamble::new().write_to(&mut bytes).unwrap();
        let chunk = Chunk::from_points("s1", &[(1, 5.0)]);
        let offset = bytes.len() as u64;
        chunk.write_to(&mut bytes).unwrap();
        let data_size = bytes.len() as u64 - offset;
        ChunkGroupFooter::new("d1", data_size, 1).write_to(&mut bytes).unwrap();

        let mut index = DeviceIndex::new();
        index.insert(ChunkGroupMetadata {
            device_id: "d1".to_string(),
            start_offset: offset,
            end_offset: bytes.len() as u64,
            chunks: vec![ChunkMetadata::from_chunk(&chunk, offset)],
        });
        let meta = FileMetadata::new(index);
        meta.write_to(&mut bytes).unwrap();
        (bytes, meta)
    }

    #[test]
    fn test_closing_metadata_from_tail() {
        let (bytes, meta) = sealed_image();
        let mut r = reader(bytes);
        assert_eq!(r.read_closing_metadata_from_tail().unwrap(), meta);
    }

    #[test]
    fn test_closing_metadata_inline() {
        let (bytes, meta) = sealed_image();
        let body_start = bytes.len() - CLOSING_TAIL_SIZE - {
            let mut body = Vec::new();
            meta.device_index().write_to(&mut body).unwrap();
            body.len()
        };
        let mut r = reader(bytes);
        r.seek_to(body_start as u64 - 1).unwrap();
        assert_eq!(r.next_token().unwrap(), Some(Token::ClosingMetadata(meta)));
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_closing_metadata_trailing_garbage_is_invalid() {
        let (mut bytes, meta) = sealed_image();
        let mut body = Vec::new();
        meta.device_index().write_to(&mut body).unwrap();
        let marker_at = bytes.len() - CLOSING_TAIL_SIZE - body.len() - 1;
        bytes.push(0);

        let mut r = reader(bytes);
        r.seek_to(marker_at as u64).unwrap();
        assert!(matches!(r.next_token(), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn test_unsealed_tail_is_rejected() {
        let (bytes, _) = sealed_image();
        let mut cut = bytes.clone();
        cut.truncate(bytes.len() - 1);
        let mut r = reader(cut);
        assert!(r.read_closing_metadata_from_tail().is_err());
    }

    #[test]
    fn test_read_chunk_at() {
        let (bytes, meta) = sealed_image();
        let chunk_meta = meta.device_index().get("d1").unwrap()[0].chunks[0].clone();
        let mut r = reader(bytes);
        let chunk = r.read_chunk_at(chunk_meta.offset).unwrap();
        assert_eq!(chunk.header.measurement_id, "s1");
        assert_eq!(chunk.num_values(), chunk_meta.num_values);

        assert!(r.read_chunk_at(0).is_err());
    }
}
