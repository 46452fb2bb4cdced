//! Flush completion handles.
//!
//! A flush is dispatched to a background worker and observed through a
//! [`FlushHandle`]. When one logical flush writes to two containers (the
//! primary and an overflow file for out-of-order data), the two handles are
//! combined into a [`JointFlushHandle`] that reports a single outcome.

pub mod joint;
pub mod task;

pub use joint::JointFlushHandle;
pub use task::{FlushCompleter, FlushTask};

use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Completion contract of an asynchronous flush.
///
/// Every method may be called from any thread while the flush is in flight.
pub trait FlushHandle: Send + Sync {
    /// Attempts to cancel the flush. Returns true if this call cancelled it.
    ///
    /// A flush that has not started can always be cancelled; a running one
    /// only when `may_interrupt` is set. A finished or already cancelled
    /// flush cannot be.
    fn cancel(&self, may_interrupt: bool) -> bool;

    /// Returns true if the flush was cancelled.
    fn is_cancelled(&self) -> bool;

    /// Returns true once the flush has reached a terminal state.
    fn is_done(&self) -> bool;

    /// Blocks until the flush finishes and returns whether it succeeded.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::FlushFailed` or `TsFileError::FlushCancelled`.
    fn wait(&self) -> Result<bool>;

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Additionally returns `TsFileError::FlushTimeout` when the flush has
    /// not finished in time. The flush itself keeps running.
    fn wait_timeout(&self, timeout: Duration) -> Result<bool>;
}

impl<T: FlushHandle + ?Sized> FlushHandle for Arc<T> {
    fn cancel(&self, may_interrupt: bool) -> bool {
        (**self).cancel(may_interrupt)
    }

    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }

    fn is_done(&self) -> bool {
        (**self).is_done()
    }

    fn wait(&self) -> Result<bool> {
        (**self).wait()
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        (**self).wait_timeout(timeout)
    }
}
