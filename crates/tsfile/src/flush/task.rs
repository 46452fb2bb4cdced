//! One-shot flush task backed by a mutex and condition variable.
//!
//! ```text
//! Pending ──start──▶ Running ──complete──▶ Succeeded(bool) | Failed
//!    │                  │
//!    └──cancel──▶ Cancelled ◀──cancel(may_interrupt)
//! ```
//!
//! The worker side holds a [`FlushCompleter`]; observers hold clones of the
//! [`FlushTask`]. A completer dropped without completing (for example when the
//! worker panics) fails the task so waiters never hang.

use crate::error::{Result, TsFileError};
use crate::flush::FlushHandle;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskState {
    Pending,
    Running,
    Succeeded(bool),
    Failed(String),
    Cancelled,
}

impl TaskState {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    fn outcome(&self) -> Option<Result<bool>> {
        match self {
            Self::Pending | Self::Running => None,
            Self::Succeeded(ok) => Some(Ok(*ok)),
            Self::Failed(reason) => Some(Err(TsFileError::FlushFailed(reason.clone()))),
            Self::Cancelled => Some(Err(TsFileError::FlushCancelled)),
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<TaskState>,
    finished: Condvar,
}

impl Shared {
    /// Moves to a terminal state and wakes every waiter.
    fn finish(&self, state: &mut TaskState, next: TaskState) {
        *state = next;
        self.finished.notify_all();
    }
}

/// Observer side of a flush running on another thread.
#[derive(Debug, Clone)]
pub struct FlushTask {
    shared: Arc<Shared>,
}

/// Worker side of a [`FlushTask`].
#[derive(Debug)]
pub struct FlushCompleter {
    shared: Arc<Shared>,
    completed: bool,
}

impl FlushTask {
    /// Creates a pending task and the completer that resolves it.
    pub fn new() -> (FlushTask, FlushCompleter) {
        let shared = Arc::new(Shared {
            state: Mutex::new(TaskState::Pending),
            finished: Condvar::new(),
        });
        (
            FlushTask {
                shared: Arc::clone(&shared),
            },
            FlushCompleter {
                shared,
                completed: false,
            },
        )
    }

    /// Runs `flush` on a new named thread.
    ///
    /// The closure is skipped entirely if the task is cancelled before the
    /// thread starts it.
    ///
    /// # Errors
    ///
    /// Returns `TsFileError::IoError` if the thread cannot be spawned.
    pub fn spawn<F>(name: impl Into<String>, flush: F) -> Result<FlushTask>
    where
        F: FnOnce() -> Result<bool> + Send + 'static,
    {
        let (task, completer) = Self::new();
        thread::Builder::new().name(name.into()).spawn(move || {
            if completer.start() {
                let result = flush();
                completer.complete(result);
            }
        })?;
        Ok(task)
    }
}

impl FlushHandle for FlushTask {
    fn cancel(&self, may_interrupt: bool) -> bool {
        let mut state = self.shared.state.lock();
        let cancellable = match *state {
            TaskState::Pending => true,
            TaskState::Running => may_interrupt,
            _ => false,
        };
        if cancellable {
            self.shared.finish(&mut state, TaskState::Cancelled);
        }
        cancellable
    }

    fn is_cancelled(&self) -> bool {
        *self.shared.state.lock() == TaskState::Cancelled
    }

    fn is_done(&self) -> bool {
        self.shared.state.lock().is_terminal()
    }

    fn wait(&self) -> Result<bool> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = state.outcome() {
                return outcome;
            }
            self.shared.finished.wait(&mut state);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => return self.wait(),
        };

        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = state.outcome() {
                return outcome;
            }
            if self
                .shared
                .finished
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state
                    .outcome()
                    .unwrap_or(Err(TsFileError::FlushTimeout(timeout)));
            }
        }
    }
}

impl FlushCompleter {
    /// Marks the task running. Returns false if it was cancelled first, in
    /// which case the flush must not be performed.
    pub fn start(&self) -> bool {
        let mut state = self.shared.state.lock();
        if *state == TaskState::Pending {
            *state = TaskState::Running;
            true
        } else {
            false
        }
    }

    /// Returns true if the task was cancelled, possibly while running.
    pub fn is_cancelled(&self) -> bool {
        *self.shared.state.lock() == TaskState::Cancelled
    }

    /// Resolves the task. Ignored if it was cancelled in the meantime.
    pub fn complete(mut self, result: Result<bool>) {
        self.completed = true;
        let mut state = self.shared.state.lock();
        if state.is_terminal() {
            return;
        }
        let next = match result {
            Ok(ok) => TaskState::Succeeded(ok),
            Err(e) => TaskState::Failed(e.to_string()),
        };
        self.shared.finish(&mut state, next);
    }
}

impl Drop for FlushCompleter {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut state = self.shared.state.lock();
        if !state.is_terminal() {
            self.shared.finish(
                &mut state,
                TaskState::Failed("flush worker exited without completing".to_string()),
            );
        }
    }
}
