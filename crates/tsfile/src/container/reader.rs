//! Reader for sealed containers.
//!
//! The closing metadata is located from the fixed tail at the end of the file
//! and decoded directly; no earlier token is replayed. Chunks are then read on
//! demand at the offsets the index records.

use crate::error::{Result, TokenError, TsFileError};
use crate::format::{
    Chunk, ChunkGroupMetadata, ChunkMetadata, DeviceIndex, FileMetadata, Preamble, TokenReader,
};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read-only view of a sealed container.
#[derive(Debug)]
pub struct ContainerReader {
    path: PathBuf,
    reader: TokenReader<BufReader<File>>,
    metadata: FileMetadata,
}

impl ContainerReader {
    /// Opens a sealed container.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::NotSealed` if the file carries no valid closing
    /// metadata, `TsFileError::InvalidMagic` or `TsFileError::UnsupportedVersion`
    /// for a foreign preamble, and `TsFileError::IoError` on I/O failures.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut reader = TokenReader::new(BufReader::new(file))?;

        match reader.read_preamble() {
            Ok(raw) => {
                Preamble::from_bytes(&raw)?;
            }
            Err(TokenError::Io(e)) => return Err(e.into()),
            Err(_) => return Err(TsFileError::NotSealed(path)),
        }

        let metadata = match reader.read_closing_metadata_from_tail() {
            Ok(metadata) => metadata,
            Err(TokenError::Io(e)) => return Err(e.into()),
            Err(e) => {
                debug!("No closing metadata in {}: {}", path.display(), e);
                return Err(TsFileError::NotSealed(path));
            }
        };

        debug!(
            "Opened container {} for reading ({} devices, {} groups)",
            path.display(),
            metadata.device_index().len(),
            metadata.device_index().group_count()
        );

        Ok(Self {
            path,
            reader,
            metadata,
        })
    }

    /// Returns the closing metadata.
    pub fn file_metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    /// Returns the device index declared by the closing metadata.
    pub fn device_index(&self) -> &DeviceIndex {
        self.metadata.device_index()
    }

    /// Returns the chunk groups of a device, empty if the device is unknown.
    pub fn chunk_groups(&self, device_id: &str) -> &[ChunkGroupMetadata] {
        self.metadata.device_index().get(device_id).unwrap_or(&[])
    }

    /// Reads the chunk an index entry points at.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::ChecksumMismatch` if a page body fails its CRC,
    /// and `TsFileError::Corrupted` if the bytes at the recorded offset do not
    /// decode to the expected chunk.
    pub fn read_chunk(&mut self, meta: &ChunkMetadata) -> Result<Chunk> {
        let chunk = match self.reader.read_chunk_at(meta.offset) {
            Ok(chunk) => chunk,
            Err(TokenError::Io(e)) => return Err(e.into()),
            Err(TokenError::ChecksumMismatch { expected, actual, .. }) => {
                return Err(TsFileError::ChecksumMismatch { expected, actual })
            }
            Err(e) => {
                return Err(TsFileError::Corrupted(format!(
                    "chunk {} at offset {}: {}",
                    meta.measurement_id, meta.offset, e
                )))
            }
        };

        if chunk.header.measurement_id != meta.measurement_id {
            return Err(TsFileError::Corrupted(format!(
                "expected chunk {} at offset {}, found {}",
                meta.measurement_id, meta.offset, chunk.header.measurement_id
            )));
        }
        Ok(chunk)
    }

    /// Returns the container path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerWriter, SyncMode, WriterConfig};
    use std::fs;
    use tempfile::TempDir;

    fn sealed(path: &Path) -> FileMetadata {
        let mut writer =
            ContainerWriter::create(path, WriterConfig::new(SyncMode::None, true)).unwrap();
        writer
            .write_chunk_group(
                "root.d1",
                &[
                    Chunk::from_points("s1", &[(1, 1.0), (2, 2.0)]),
                    Chunk::from_points("s2", &[(5, 9.0)]),
                ],
            )
            .unwrap();
        writer.flush().unwrap();
        writer
            .write_chunk_group("root.d2", &[Chunk::from_points("s1", &[(3, 3.0)])])
            .unwrap();
        writer.close().unwrap()
    }

    #[test]
    fn test_read_sealed_container() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.tsfile");
        let metadata = sealed(&path);

        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.file_metadata(), &metadata);
        assert_eq!(reader.chunk_groups("root.d1").len(), 1);
        assert!(reader.chunk_groups("root.d9").is_empty());

        let meta = reader.chunk_groups("root.d1")[0]
            .chunk("s2")
            .unwrap()
            .clone();
        let chunk = reader.read_chunk(&meta).unwrap();
        assert_eq!(chunk.header.measurement_id, "s2");
        assert_eq!(chunk.time_range(), (5, 5));
    }

    #[test]
    fn test_unsealed_container_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.tsfile");
        let mut writer = ContainerWriter::create(&path, WriterConfig::default()).unwrap();
        writer
            .write_chunk_group("root.d1", &[Chunk::from_points("s1", &[(1, 1.0)])])
            .unwrap();
        writer.flush().unwrap();
        drop(writer);

        assert!(matches!(
            ContainerReader::open(&path),
            Err(TsFileError::NotSealed(p)) if p == path
        ));
    }

    #[test]
    fn test_damaged_tail_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.tsfile");
        sealed(&path);

        let mut bytes = fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[len - 6] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            ContainerReader::open(&path),
            Err(TsFileError::NotSealed(_))
        ));
    }

    #[test]
    fn test_damaged_page_reports_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.tsfile");
        sealed(&path);

        let meta = ContainerReader::open(&path).unwrap().chunk_groups("root.d1")[0]
            .chunk("s2")
            .unwrap()
            .clone();
        let size = Chunk::from_points("s2", &[(5, 9.0)]).serialized_size() as u64;

        // Last byte of the chunk's only page body.
        let mut bytes = fs::read(&path).unwrap();
        bytes[(meta.offset + size - 1) as usize] ^= 0x01;
        fs::write(&path, bytes).unwrap();

        let mut reader = ContainerReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_chunk(&meta),
            Err(TsFileError::ChecksumMismatch { expected, actual }) if expected != actual
        ));
    }

    #[test]
    fn test_mismatched_index_entry_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.tsfile");
        sealed(&path);

        let mut reader = ContainerReader::open(&path).unwrap();
        let mut meta = reader.chunk_groups("root.d1")[0].chunks[0].clone();
        meta.measurement_id = "s9".to_string();
        assert!(matches!(
            reader.read_chunk(&meta),
            Err(TsFileError::Corrupted(_))
        ));

        meta.offset += 1;
        assert!(matches!(
            reader.read_chunk(&meta),
            Err(TsFileError::Corrupted(_))
        ));
    }
}
