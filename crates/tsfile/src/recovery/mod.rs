//! Crash recovery scanner.
//!
//! Walks a container from its preamble, one token at a time, and computes the
//! longest prefix that is provably complete.
//!
//! # Commit protocol
//!
//! A chunk-group footer is only *pending* when it is decoded. It becomes
//! confirmed when the scanner successfully decodes one more token after it:
//! a chunk, another footer, a separator, or the closing metadata. A footer
//! followed by end of stream, by garbage, or by a truncated token is
//! indistinguishable from a footer whose writer crashed before it became
//! durable, and is discarded.
//!
//! ```text
//! [preamble][chunk][chunk][footer d1][chunk][footer d2]      EOF
//!           ^ confirmed = 8          ^ pending d1 ──confirmed by next chunk
//!                                                   ^ pending d2 ── dropped
//! ```
//!
//! The scan never returns an error for a crashed file: truncation is the
//! recovery. Only I/O failures and foreign preambles surface to the caller.

use crate::error::{Result, TokenError};
use crate::format::{
    Chunk, ChunkGroupFooter, ChunkGroupMetadata, ChunkMetadata, DeviceIndex, FileMetadata,
    Preamble, Token, TokenReader, PREAMBLE_SIZE,
};
use std::fmt;
use std::io::{self, Read, Seek};
use tracing::{debug, trace};

/// Scanner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Still consuming tokens.
    Scanning,
    /// Closing metadata found: the container is complete and read-only.
    Sealed,
    /// Stopped before the end of a complete container.
    Stopped,
}

/// Why a scan stopped short of a sealed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The preamble itself is shorter than its fixed size.
    IncompletePreamble,
    /// The stream ended cleanly at a token boundary.
    EndOfStream,
    /// A token's declared length runs past the end of the stream.
    IncompleteToken {
        /// Offset of the token's marker byte.
        offset: u64,
    },
    /// A token is self-contradictory or unrecognized.
    InvalidToken {
        /// Offset of the token's marker byte.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompletePreamble => write!(f, "incomplete preamble"),
            Self::EndOfStream => write!(f, "end of stream"),
            Self::IncompleteToken { offset } => write!(f, "incomplete token at {}", offset),
            Self::InvalidToken { offset, reason } => {
                write!(f, "invalid token at {}: {}", offset, reason)
            }
        }
    }
}

/// Result of one recovery pass.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// Final scanner state, never `Scanning`.
    pub state: ScanState,
    /// Longest prefix proven well-formed; the safe append position.
    pub confirmed_offset: u64,
    /// Length of the source when the scan began.
    pub file_len: u64,
    /// Confirmed chunk groups per device.
    pub device_index: DeviceIndex,
    /// Set when the scan stopped before a sealed end.
    pub stop_reason: Option<StopReason>,
}

impl ScanOutcome {
    /// Returns true unless the container is sealed.
    pub fn can_write(&self) -> bool {
        self.state != ScanState::Sealed
    }

    /// Bytes past the confirmed offset that recovery discards.
    pub fn discarded_bytes(&self) -> u64 {
        self.file_len.saturating_sub(self.confirmed_offset)
    }
}

/// Scan accumulator threaded through the token loop.
#[derive(Debug)]
struct ScanCursor {
    confirmed: u64,
    /// Footer decoded but not yet confirmed by a following token.
    pending: Option<ChunkGroupMetadata>,
    /// Chunks decoded since the last group boundary.
    open_chunks: Vec<ChunkMetadata>,
    /// Offset of the first chunk in `open_chunks`.
    group_start: u64,
    index: DeviceIndex,
}

impl ScanCursor {
    fn new(confirmed: u64) -> Self {
        Self {
            confirmed,
            pending: None,
            open_chunks: Vec::new(),
            group_start: confirmed,
            index: DeviceIndex::new(),
        }
    }

    /// Commits the pending group, if any. A no-op otherwise.
    fn confirm_pending(&mut self) {
        if let Some(group) = self.pending.take() {
            self.confirmed = group.end_offset;
            self.index.insert(group);
        }
    }

    fn accept_chunk(&mut self, offset: u64, chunk: &Chunk) {
        self.confirm_pending();
        if self.open_chunks.is_empty() {
            self.group_start = offset;
        }
        self.open_chunks.push(ChunkMetadata::from_chunk(chunk, offset));
    }

    fn accept_footer(
        &mut self,
        offset: u64,
        footer: ChunkGroupFooter,
        end: u64,
    ) -> std::result::Result<(), String> {
        if self.open_chunks.is_empty() {
            return Err(format!(
                "footer for {} closes a group without chunks",
                footer.device_id
            ));
        }
        if footer.num_chunks as usize != self.open_chunks.len() {
            return Err(format!(
                "footer for {} declares {} chunks, {} present",
                footer.device_id,
                footer.num_chunks,
                self.open_chunks.len()
            ));
        }
        let data_size = offset - self.group_start;
        if footer.data_size != data_size {
            return Err(format!(
                "footer for {} declares {} data bytes, {} present",
                footer.device_id, footer.data_size, data_size
            ));
        }

        self.confirm_pending();
        self.pending = Some(ChunkGroupMetadata {
            device_id: footer.device_id,
            start_offset: self.group_start,
            end_offset: end,
            chunks: std::mem::take(&mut self.open_chunks),
        });
        Ok(())
    }

    fn seal(&mut self, metadata: FileMetadata, file_len: u64) {
        self.confirm_pending();
        self.open_chunks.clear();
        self.index = metadata.into_device_index();
        self.confirmed = file_len;
    }
}

/// Runs one recovery pass over `source`.
///
/// # Errors
///
/// Returns `TsFileError::InvalidMagic` or `TsFileError::UnsupportedVersion`
/// for a preamble, complete or cut short, that does not belong to this
/// format, and
/// `TsFileError::IoError` for failures of the source itself. Incomplete or
/// invalid tokens are never errors.
pub fn scan<R: Read + Seek>(source: R) -> Result<ScanOutcome> {
    let mut reader = TokenReader::new(source)?;
    let file_len = reader.len();

    match reader.read_preamble() {
        Ok(raw) => {
            Preamble::from_bytes(&raw)?;
        }
        Err(TokenError::Io(e)) => return Err(e.into()),
        Err(_) => {
            // Only a short prefix of our own preamble counts as a crash.
            let present = match reader.read_preamble_prefix() {
                Ok(present) => present,
                Err(TokenError::Io(e)) => return Err(e.into()),
                // The source shrank while being read; leave it alone.
                Err(e) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, e).into()),
            };
            Preamble::check_prefix(&present)?;
            debug!("Preamble incomplete: {} of {} bytes", file_len, PREAMBLE_SIZE);
            return Ok(ScanOutcome {
                state: ScanState::Stopped,
                confirmed_offset: 0,
                file_len,
                device_index: DeviceIndex::new(),
                stop_reason: Some(StopReason::IncompletePreamble),
            });
        }
    }

    let mut cursor = ScanCursor::new(PREAMBLE_SIZE as u64);
    let mut state = ScanState::Scanning;
    let mut stop_reason = None;
    let mut token_count = 0usize;

    while state == ScanState::Scanning {
        let offset = reader.position();
        match reader.next_token() {
            Ok(None) => {
                stop_reason = Some(StopReason::EndOfStream);
                state = ScanState::Stopped;
            }
            Ok(Some(token)) => {
                token_count += 1;
                trace!("Decoded {:?} token at offset {}", token.marker(), offset);
                match token {
                    Token::Chunk(chunk) => cursor.accept_chunk(offset, &chunk),
                    Token::ChunkGroupFooter(footer) => {
                        if let Err(reason) = cursor.accept_footer(offset, footer, reader.position())
                        {
                            stop_reason = Some(StopReason::InvalidToken { offset, reason });
                            state = ScanState::Stopped;
                        }
                    }
                    Token::Separator => cursor.confirm_pending(),
                    Token::ClosingMetadata(metadata) => {
                        cursor.seal(metadata, file_len);
                        state = ScanState::Sealed;
                    }
                }
            }
            Err(TokenError::Incomplete { needed, available }) => {
                debug!(
                    "Token at offset {} needs {} bytes, {} available",
                    offset, needed, available
                );
                stop_reason = Some(StopReason::IncompleteToken { offset });
                state = ScanState::Stopped;
            }
            Err(e @ TokenError::ChecksumMismatch { .. }) => {
                stop_reason = Some(StopReason::InvalidToken {
                    offset,
                    reason: e.to_string(),
                });
                state = ScanState::Stopped;
            }
            Err(TokenError::Invalid(reason)) => {
                stop_reason = Some(StopReason::InvalidToken { offset, reason });
                state = ScanState::Stopped;
            }
            Err(TokenError::Io(e)) => return Err(e.into()),
        }
    }

    debug!(
        "Recovery scan finished: state={:?}, tokens={}, confirmed={} of {} bytes, groups={}{}",
        state,
        token_count,
        cursor.confirmed,
        file_len,
        cursor.index.group_count(),
        stop_reason
            .as_ref()
            .map(|r| format!(", stopped on {}", r))
            .unwrap_or_default()
    );

    Ok(ScanOutcome {
        state,
        confirmed_offset: cursor.confirmed,
        file_len,
        device_index: cursor.index,
        stop_reason,
    })
}
