//! Append-only container writer.
//!
//! # Durability
//!
//! A chunk group becomes recoverable only once a later token follows its
//! footer on disk. [`ContainerWriter::flush`] therefore emits a separator after
//! the last written group (unless disabled in [`WriterConfig`]) before syncing,
//! so everything acknowledged by a flush survives a crash.
//!
//! ```text
//! write_chunk_group → chunks + footer (pending)
//! flush             → separator (confirms) → buffer flush → fsync
//! close             → closing metadata (confirms + seals) → fsync
//! ```

use crate::container::RestorableContainer;
use crate::error::{Result, TsFileError};
use crate::flush::FlushTask;
use crate::format::{
    Chunk, ChunkGroupFooter, ChunkGroupMetadata, ChunkMetadata, DeviceIndex, FileMetadata,
    MetaMarker, Preamble, PREAMBLE_SIZE,
};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sync mode for flush durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync on every flush (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Configuration for writer behavior.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
    /// Emit a separator on flush when groups were written since the last one.
    pub separator_on_flush: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::default(),
            separator_on_flush: true,
        }
    }
}

impl WriterConfig {
    /// Creates a writer configuration with custom settings.
    pub fn new(sync_mode: SyncMode, separator_on_flush: bool) -> Self {
        Self {
            sync_mode,
            separator_on_flush,
        }
    }
}

/// Writes chunk groups to a container.
#[derive(Debug)]
pub struct ContainerWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Offset of the next byte to be written.
    position: u64,
    index: DeviceIndex,
    /// Groups written since the last separator or flush.
    unflushed_groups: usize,
    /// Set once a write fails; `position` may no longer match the bytes.
    poisoned: bool,
    config: WriterConfig,
}

impl ContainerWriter {
    /// Creates a new container, replacing any file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the preamble cannot
    /// be written.
    pub fn create(path: impl AsRef<Path>, config: WriterConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut writer = BufWriter::new(file);
        Preamble::new().write_to(&mut writer)?;
        writer.flush()?;

        debug!("Created container {}", path.display());

        Ok(Self {
            path,
            writer,
            position: PREAMBLE_SIZE as u64,
            index: DeviceIndex::new(),
            unflushed_groups: 0,
            poisoned: false,
            config,
        })
    }

    /// Resumes appending to a recovered container at its confirmed offset.
    ///
    /// The recovered device index is carried over, so groups written before
    /// the crash appear in the closing metadata alongside new ones. When any
    /// group was recovered, a separator is written and synced first so the
    /// last of them survives another crash.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::SealedReopen` if the container is sealed.
    pub fn resume(container: RestorableContainer, config: WriterConfig) -> Result<Self> {
        let (path, mut file, outcome) = container.into_parts()?;

        file.seek(SeekFrom::Start(outcome.confirmed_offset))?;
        let mut writer = BufWriter::new(file);
        let mut position = outcome.confirmed_offset;

        // Nothing survived, not even the preamble.
        if position == 0 {
            Preamble::new().write_to(&mut writer)?;
            writer.flush()?;
            position = PREAMBLE_SIZE as u64;
        }

        debug!(
            "Resumed container {} at offset {} with {} recovered groups",
            path.display(),
            position,
            outcome.device_index.group_count()
        );

        let has_groups = !outcome.device_index.is_empty();
        let mut resumed = Self {
            path,
            writer,
            position,
            index: outcome.device_index,
            unflushed_groups: 0,
            poisoned: false,
            config,
        };

        // Truncation left the last recovered footer unconfirmed again.
        if has_groups {
            resumed.write_separator()?;
            resumed.writer.flush()?;
            resumed.sync()?;
        }

        Ok(resumed)
    }

    /// Writes one device's chunks followed by the group footer.
    ///
    /// The group stays pending on disk until a later token follows it; call
    /// [`flush`](Self::flush) to make it durable.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::InvalidChunkGroup` if the device id is empty or
    /// too long, no chunks are given, or a chunk's header disagrees with its
    /// pages. Nothing is written in that case. An I/O failure poisons the
    /// writer; see [`is_poisoned`](Self::is_poisoned).
    pub fn write_chunk_group(
        &mut self,
        device_id: &str,
        chunks: &[Chunk],
    ) -> Result<ChunkGroupMetadata> {
        if device_id.is_empty() {
            return Err(TsFileError::InvalidChunkGroup(
                "device id must not be empty".to_string(),
            ));
        }
        if device_id.len() > u16::MAX as usize {
            return Err(TsFileError::InvalidChunkGroup(format!(
                "device id of {} bytes is too long",
                device_id.len()
            )));
        }
        if chunks.is_empty() {
            return Err(TsFileError::InvalidChunkGroup(format!(
                "chunk group for {} has no chunks",
                device_id
            )));
        }
        for chunk in chunks {
            chunk.validate()?;
        }
        self.check_usable()?;

        let group = encode_group(&mut self.writer, self.position, device_id, chunks);
        let group = self.poison_on_error(group)?;

        self.position = group.end_offset;
        self.index.insert(group.clone());
        self.unflushed_groups += 1;

        Ok(group)
    }

    /// Writes a separator, confirming the last written group.
    pub fn write_separator(&mut self) -> Result<()> {
        self.check_usable()?;
        let written = MetaMarker::Separator.write_to(&mut self.writer);
        self.poison_on_error(written)?;
        self.position += 1;
        self.unflushed_groups = 0;
        Ok(())
    }

    /// Makes every written group durable.
    pub fn flush(&mut self) -> Result<()> {
        self.check_usable()?;
        let groups = self.unflushed_groups;
        if self.config.separator_on_flush && groups > 0 {
            self.write_separator()?;
        }

        // Flush and sync
        let flushed = self.writer.flush().map_err(TsFileError::from);
        self.poison_on_error(flushed)?;
        let synced = self.sync();
        self.poison_on_error(synced)?;

        debug!(
            "Flushed {} chunk groups to {} (offset {})",
            groups,
            self.path.display(),
            self.position
        );

        self.unflushed_groups = 0;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        match self.config.sync_mode {
            SyncMode::Fsync => {
                self.writer.get_ref().sync_all()?;
            }
            SyncMode::Fdatasync => {
                self.writer.get_ref().sync_data()?;
            }
            SyncMode::None => {
                // No sync - only for testing
            }
        }
        Ok(())
    }

    /// Seals the container with closing metadata covering every group.
    ///
    /// A sealed container can be read with
    /// [`ContainerReader`](crate::container::ContainerReader) but never
    /// reopened for writing.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::WriterPoisoned` without writing anything if an
    /// earlier write failed.
    pub fn close(mut self) -> Result<FileMetadata> {
        self.check_usable()?;
        let metadata = FileMetadata::new(std::mem::take(&mut self.index));
        self.position += metadata.write_to(&mut self.writer)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        debug!(
            "Sealed container {} at {} bytes ({} devices)",
            self.path.display(),
            self.position,
            metadata.device_index().len()
        );

        Ok(metadata)
    }

    /// Stops writing without sealing, leaving the file as a crash would.
    ///
    /// Buffered bytes are written out but not synced and no separator is
    /// added. Returns the file length.
    pub fn abandon(mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.position)
    }

    /// Offset of the next byte to be written.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns true once a write has failed. A poisoned writer rejects every
    /// later write, flush and close; the file can still be recovered by
    /// reopening it.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(TsFileError::WriterPoisoned(self.path.clone()));
        }
        Ok(())
    }

    fn poison_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(
                "Write to {} failed at offset {}, rejecting further writes: {}",
                self.path.display(),
                self.position,
                e
            );
            self.poisoned = true;
        }
        result
    }

    /// Index of every group written or recovered so far.
    pub fn device_index(&self) -> &DeviceIndex {
        &self.index
    }

    /// Returns the container path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes a shared writer on a background thread.
    ///
    /// The returned task completes with `true` once the flush is durable.
    /// Cancelling it before its thread starts skips the flush.
    pub fn flush_in_background(this: &Arc<Mutex<ContainerWriter>>) -> Result<FlushTask> {
        let writer = Arc::clone(this);
        let name = format!(
            "tsfile-flush-{}",
            this.lock()
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );

        FlushTask::spawn(name, move || {
            let mut writer = writer.lock();
            let result = writer.flush();
            if let Err(e) = &result {
                warn!("Background flush of {} failed: {}", writer.path.display(), e);
            }
            result.map(|()| true)
        })
    }
}

/// Writes one group's chunks and footer starting at `start_offset`.
fn encode_group<W: Write>(
    writer: &mut W,
    start_offset: u64,
    device_id: &str,
    chunks: &[Chunk],
) -> Result<ChunkGroupMetadata> {
    let mut position = start_offset;
    let mut chunk_metadata = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        chunk.write_to(writer)?;
        chunk_metadata.push(ChunkMetadata::from_chunk(chunk, position));
        position += chunk.serialized_size() as u64;
    }

    let footer = ChunkGroupFooter::new(device_id, position - start_offset, chunks.len() as u32);
    footer.write_to(writer)?;
    position += footer.serialized_size() as u64;

    Ok(ChunkGroupMetadata {
        device_id: device_id.to_string(),
        start_offset,
        end_offset: position,
        chunks: chunk_metadata,
    })
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        // Best effort to write out buffered bytes
        if let Err(e) = self.writer.flush() {
            warn!("Failed to flush container writer on drop: {:?}", e);
        }
    }
}
