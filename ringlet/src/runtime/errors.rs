use crate::task::{Id, JoinError, ResumeError};
use std::io;

/// Errors surfaced by a [`Context`](crate::runtime::Context) itself, as
/// opposed to the per-request [`IoError`](crate::sqe::IoError).
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    /// The kernel queue could not be created. The context cannot exist
    /// without it.
    #[error("failed to initialize the kernel queue: {0}")]
    KernelQueueInit(#[source] io::Error),

    /// A task nobody joins on panicked.
    #[error("detached task {id} panicked: {message}")]
    UnhandledPanic { id: Id, message: String },

    /// Nothing is runnable and no request is outstanding.
    #[error("deadlock: no task can make progress")]
    Deadlock,

    #[error("context was stopped")]
    Stopped,

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Resume(#[from] ResumeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RuntimeError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::KernelQueueInit(_) | RuntimeError::UnhandledPanic { .. }
        )
    }
}
