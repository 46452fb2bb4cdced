//! Alopex TsFile - crash-recoverable chunk containers for time series data.
//!
//! A container is an append-only file of chunk groups (one device's chunks
//! terminated by a footer). A writer that dies mid-append leaves a valid
//! preamble followed by an arbitrary amount of partially written structure;
//! this crate finds the longest provably complete prefix, cuts the rest off,
//! and rebuilds the per-device index so appends can resume.
//!
//! # Components
//!
//! - [`format::token::TokenReader`]: decodes one structural token at a time
//! - [`recovery::scan`]: lookahead-commit state machine over those tokens
//! - [`RestorableContainer`]: runs the scan once, truncates, exposes the results
//! - [`ContainerWriter`] / [`ContainerReader`]: produce and read back containers
//! - [`JointFlushHandle`]: one completion contract over up to two flush tasks
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_tsfile::{ContainerWriter, RestorableContainer, WriterConfig};
//!
//! // After a crash, recover the file and keep appending.
//! let container = RestorableContainer::open(&path)?;
//! if container.can_write() {
//!     let mut writer = container.into_writer(WriterConfig::default())?;
//!     writer.write_chunk_group("root.plant.d1", &chunks)?;
//!     writer.flush()?;
//!     writer.close()?;
//! }
//! ```

#![deny(missing_docs)]

pub mod container;
pub mod error;
pub mod flush;
pub mod format;
pub mod recovery;

pub use container::{
    ContainerReader, ContainerWriter, RestorableContainer, SyncMode, WriterConfig,
};
pub use error::{Result, TokenError, TsFileError};
pub use flush::{FlushHandle, FlushTask, JointFlushHandle};
pub use format::{
    Chunk, ChunkGroupFooter, ChunkGroupMetadata, ChunkMetadata, DeviceIndex, FileMetadata, Page,
};
pub use recovery::{ScanOutcome, ScanState, StopReason};
