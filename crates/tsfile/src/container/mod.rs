//! Container handle.
//!
//! [`RestorableContainer`] runs the recovery scan once when a container is
//! opened, physically truncates whatever the scan could not confirm, and
//! freezes the result. A wrapping writer consults [`can_write`],
//! [`confirmed_offset`] and [`device_index`] before appending.
//!
//! [`can_write`]: RestorableContainer::can_write
//! [`confirmed_offset`]: RestorableContainer::confirmed_offset
//! [`device_index`]: RestorableContainer::device_index

pub mod reader;
pub mod writer;

pub use reader::ContainerReader;
pub use writer::{ContainerWriter, SyncMode, WriterConfig};

use crate::error::{Result, TsFileError};
use crate::format::DeviceIndex;
use crate::recovery::{self, ScanOutcome, ScanState, StopReason};
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A container reopened after a possible crash.
#[derive(Debug)]
pub struct RestorableContainer {
    path: PathBuf,
    /// Read/write handle, present only when the container accepts appends.
    file: Option<File>,
    outcome: ScanOutcome,
}

impl RestorableContainer {
    /// Scans the container at `path` and truncates it to its confirmed offset.
    ///
    /// A sealed container is only ever opened read-only and is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, does not start with a
    /// container preamble, or cannot be truncated. A file too short to hold a
    /// preamble is only truncated when its bytes begin one.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let outcome = {
            let file = File::open(&path)?;
            recovery::scan(BufReader::new(file))?
        };

        if outcome.state == ScanState::Sealed {
            debug!(
                "Opened sealed container {} ({} bytes, {} devices)",
                path.display(),
                outcome.file_len,
                outcome.device_index.len()
            );
            return Ok(Self {
                path,
                file: None,
                outcome,
            });
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if outcome.confirmed_offset < outcome.file_len {
            warn!(
                "Truncating container {} from {} to {} bytes ({})",
                path.display(),
                outcome.file_len,
                outcome.confirmed_offset,
                outcome
                    .stop_reason
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default()
            );
            file.set_len(outcome.confirmed_offset)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            file: Some(file),
            outcome,
        })
    }

    /// Returns true unless the container was sealed by an orderly close.
    pub fn can_write(&self) -> bool {
        self.outcome.can_write()
    }

    /// Safe append position; the file length after truncation.
    pub fn confirmed_offset(&self) -> u64 {
        self.outcome.confirmed_offset
    }

    /// Device index rebuilt by the scan (or read from closing metadata).
    pub fn device_index(&self) -> &DeviceIndex {
        &self.outcome.device_index
    }

    /// Final scanner state.
    pub fn state(&self) -> ScanState {
        self.outcome.state
    }

    /// Why the scan stopped, if it did not reach a sealed end.
    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.outcome.stop_reason.as_ref()
    }

    /// Number of bytes cut off by recovery.
    pub fn truncated_bytes(&self) -> u64 {
        if self.can_write() {
            self.outcome.discarded_bytes()
        } else {
            0
        }
    }

    /// Returns the container path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hands the recovered container to a writer that resumes appending.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::SealedReopen` if the container is sealed.
    pub fn into_writer(self, config: WriterConfig) -> Result<ContainerWriter> {
        ContainerWriter::resume(self, config)
    }

    /// Splits the container into its path, write handle and scan result.
    pub(crate) fn into_parts(self) -> Result<(PathBuf, File, ScanOutcome)> {
        match self.file {
            Some(file) => Ok((self.path, file, self.outcome)),
            None => Err(TsFileError::SealedReopen(self.path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Chunk, MetaMarker, PREAMBLE_SIZE};
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn chunks() -> Vec<Chunk> {
        vec![
            Chunk::from_points("s1", &[(1, 1.0), (2, 2.0)]),
            Chunk::from_points("s2", &[(1, 3.0)]),
        ]
    }

    fn write_unsealed(path: &Path, groups: usize) -> Vec<u64> {
        let config = WriterConfig {
            sync_mode: SyncMode::None,
            separator_on_flush: false,
        };
        let mut writer = ContainerWriter::create(path, config).unwrap();
        let mut ends = Vec::new();
        for i in 0..groups {
            let group = writer
                .write_chunk_group(&format!("root.d{}", i), &chunks())
                .unwrap();
            ends.push(group.end_offset);
        }
        writer.abandon().unwrap();
        ends
    }

    #[test]
    fn test_open_truncates_unconfirmed_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tsfile");
        let ends = write_unsealed(&path, 2);

        let container = RestorableContainer::open(&path).unwrap();
        assert!(container.can_write());
        assert_eq!(container.confirmed_offset(), ends[0]);
        assert_eq!(container.truncated_bytes(), ends[1] - ends[0]);
        assert_eq!(fs::metadata(&path).unwrap().len(), ends[0]);
        assert!(container.device_index().contains_device("root.d0"));
        assert!(!container.device_index().contains_device("root.d1"));
        assert_eq!(container.stop_reason(), Some(&StopReason::EndOfStream));
    }

    #[test]
    fn test_reopen_drops_newly_trailing_group() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tsfile");
        write_unsealed(&path, 3);

        let first = RestorableContainer::open(&path).unwrap();
        let offset = first.confirmed_offset();
        drop(first);

        // The trailing group is gone, so the second-to-last footer is now last.
        let second = RestorableContainer::open(&path).unwrap();
        assert!(second.confirmed_offset() < offset);
    }

    #[test]
    fn test_open_sealed_is_read_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sealed.tsfile");
        let mut writer = ContainerWriter::create(&path, WriterConfig::default()).unwrap();
        writer.write_chunk_group("root.d0", &chunks()).unwrap();
        writer.close().unwrap();
        let len = fs::metadata(&path).unwrap().len();

        let container = RestorableContainer::open(&path).unwrap();
        assert!(!container.can_write());
        assert_eq!(container.state(), ScanState::Sealed);
        assert_eq!(container.confirmed_offset(), len);
        assert_eq!(container.truncated_bytes(), 0);

        let result = container.into_writer(WriterConfig::default());
        assert!(matches!(result, Err(TsFileError::SealedReopen(p)) if p == path));
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
    }

    #[test]
    fn test_open_incomplete_preamble() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.tsfile");
        fs::write(&path, b"ATS").unwrap();

        let container = RestorableContainer::open(&path).unwrap();
        assert!(container.can_write());
        assert_eq!(container.confirmed_offset(), 0);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(
            container.stop_reason(),
            Some(&StopReason::IncompletePreamble)
        );
    }

    #[test]
    fn test_open_foreign_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.bin");
        fs::write(&path, b"NOTATSFILE").unwrap();

        assert!(matches!(
            RestorableContainer::open(&path),
            Err(TsFileError::InvalidMagic(_))
        ));
        assert_eq!(fs::read(&path).unwrap(), b"NOTATSFILE");
    }

    #[test]
    fn test_open_short_foreign_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.txt");
        fs::write(&path, b"hello").unwrap();

        assert!(matches!(
            RestorableContainer::open(&path),
            Err(TsFileError::InvalidMagic(_))
        ));
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_open_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.tsfile");
        fs::write(&path, b"").unwrap();

        let container = RestorableContainer::open(&path).unwrap();
        assert!(container.can_write());
        assert_eq!(container.confirmed_offset(), 0);
        assert_eq!(
            container.stop_reason(),
            Some(&StopReason::IncompletePreamble)
        );
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = RestorableContainer::open(dir.path().join("missing.tsfile"));
        assert!(matches!(result, Err(TsFileError::IoError(_))));
    }

    #[test]
    fn test_garbage_after_separator_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tsfile");
        let ends = write_unsealed(&path, 1);
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            MetaMarker::Separator.write_to(&mut file).unwrap();
            file.write_all(&[0xEE; 17]).unwrap();
        }

        let container = RestorableContainer::open(&path).unwrap();
        assert_eq!(container.confirmed_offset(), ends[0]);
        assert!(container.confirmed_offset() > PREAMBLE_SIZE as u64);
        assert_eq!(fs::metadata(&path).unwrap().len(), ends[0]);
    }
}
