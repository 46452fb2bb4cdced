//! Joint flush handle.
//!
//! Combines the flush of a primary container with the optional flush of its
//! overflow container. The combined flush succeeded only if every part did.

use crate::error::{Result, TsFileError};
use crate::flush::FlushHandle;
use std::time::{Duration, Instant};

/// One completion contract over a primary and an optional overflow flush.
///
/// Holds no lock of its own: every query is answered by the sub-handles, and
/// `cancel` is the only call that changes their state.
pub struct JointFlushHandle {
    /// Primary first, then the overflow flush if present.
    handles: Vec<Box<dyn FlushHandle>>,
    has_overflow: bool,
}

impl JointFlushHandle {
    /// Creates a joint handle. The overflow flush is optional.
    pub fn new(primary: Box<dyn FlushHandle>, overflow: Option<Box<dyn FlushHandle>>) -> Self {
        let has_overflow = overflow.is_some();
        let mut handles = Vec::with_capacity(2);
        handles.push(primary);
        handles.extend(overflow);
        Self {
            handles,
            has_overflow,
        }
    }

    /// Returns true if an overflow flush was supplied at construction.
    pub fn has_overflow_flush_task(&self) -> bool {
        self.has_overflow
    }
}

impl FlushHandle for JointFlushHandle {
    /// Cancels every part; true only if every part accepted.
    ///
    /// Each part is asked even after another refuses, and a part that
    /// accepted stays cancelled.
    fn cancel(&self, may_interrupt: bool) -> bool {
        self.handles
            .iter()
            .map(|handle| handle.cancel(may_interrupt))
            .fold(true, |all, cancelled| all && cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.handles.iter().all(|handle| handle.is_cancelled())
    }

    fn is_done(&self) -> bool {
        self.handles.iter().all(|handle| handle.is_done())
    }

    /// Waits for every part in order; the first failure is returned as is.
    fn wait(&self) -> Result<bool> {
        let mut succeeded = true;
        for handle in &self.handles {
            succeeded &= handle.wait()?;
        }
        Ok(succeeded)
    }

    /// Like [`wait`](FlushHandle::wait), with one deadline for the whole call.
    ///
    /// A timeout leaves the parts running; nothing is cancelled.
    fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut succeeded = true;
        for handle in &self.handles {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            succeeded &= handle.wait_timeout(remaining).map_err(|e| match e {
                TsFileError::FlushTimeout(_) => TsFileError::FlushTimeout(timeout),
                other => other,
            })?;
        }
        Ok(succeeded)
    }
}

impl std::fmt::Debug for JointFlushHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JointFlushHandle")
            .field("parts", &self.handles.len())
            .field("has_overflow", &self.has_overflow)
            .finish()
    }
}
