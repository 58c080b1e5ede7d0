use crate::context::BufferPoolError;
use crate::sqe::Target;
use crate::task::Id;
use io_uring::squeue::PushError;
use std::ffi::NulError;
use std::io::{self, Error};

/// Invalid arguments caught while building a [`Request`](crate::sqe::Request),
/// before anything reaches the kernel.
#[derive(thiserror::Error, Debug)]
pub enum OpcodeError {
    #[error("Sleeping zero is an anti-pattern, please use `yield_now` instead.")]
    SleepZeroDuration,

    #[error("Path contains an interior nul byte: {0}")]
    InvalidPath(#[from] NulError),

    #[error("Buffer of {0} bytes does not fit in a single request")]
    BufferTooLarge(usize),

    #[error("Operation does not accept target {0:?}")]
    UnsupportedTarget(Target),

    #[error("Multishot receive submitted without a registered buffer group")]
    MissingBufferGroup,
}

impl PartialEq for OpcodeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SleepZeroDuration, Self::SleepZeroDuration) => true,
            (Self::InvalidPath(_), Self::InvalidPath(_)) => true,
            (Self::BufferTooLarge(a), Self::BufferTooLarge(b)) => a == b,
            (Self::UnsupportedTarget(a), Self::UnsupportedTarget(b)) => a == b,
            (Self::MissingBufferGroup, Self::MissingBufferGroup) => true,
            _ => false,
        }
    }
}

/// Error type returned by every request-bound future.
///
/// Kernel failures are carried as [`IoError::Io`] built from the raw errno of
/// the completion, so `raw_os_error()` always gives back the exact code the
/// kernel produced. The runtime applies no retry policy of its own.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    /// The submission queue ring for io_uring is full.
    #[error("Submission queue ring is full, cannot submit IO")]
    SqRingFull(#[from] PushError),

    /// The task already has a request outstanding. A task owns at most one
    /// request at a time; spawn a child task to overlap operations.
    #[error("Task {0} already has a request outstanding")]
    Busy(Id),

    #[error("Request-bound future polled outside of a task")]
    NotInTask,

    #[error("Opcode error: {0}")]
    Opcode(#[from] OpcodeError),

    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("An unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

impl IoError {
    /// Builds an error from a positive errno value.
    pub fn from_errno(errno: i32) -> Self {
        IoError::Io(Error::from_raw_os_error(errno))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            IoError::SqRingFull(_) | IoError::Busy(_) => true,
            IoError::Io(e) => e
                .raw_os_error()
                .is_some_and(|errno| matches!(errno, libc::EAGAIN | libc::EINTR)),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.raw_os_error() == Some(libc::ECANCELED)
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IoError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SqRingFull(_), Self::SqRingFull(_)) => true,
            (Self::Busy(a), Self::Busy(b)) => a == b,
            (Self::NotInTask, Self::NotInTask) => true,
            (Self::Opcode(a), Self::Opcode(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => match (a.raw_os_error(), b.raw_os_error()) {
                (Some(a), Some(b)) => a == b,
                _ => a.kind() == b.kind(),
            },
            _ => false,
        }
    }
}

impl From<IoError> for io::Error {
    fn from(e: IoError) -> Self {
        match e {
            IoError::Io(io_err) => io_err,
            _ => Error::other(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::eagain(libc::EAGAIN, true, false)]
    #[case::eintr(libc::EINTR, true, false)]
    #[case::ecanceled(libc::ECANCELED, false, true)]
    #[case::enoent(libc::ENOENT, false, false)]
    fn test_errno_classification(
        #[case] errno: i32,
        #[case] retryable: bool,
        #[case] cancelled: bool,
    ) {
        let err = IoError::from_errno(errno);
        assert_eq!(err.raw_os_error(), Some(errno));
        assert_eq!(err.is_retryable(), retryable);
        assert_eq!(err.is_cancelled(), cancelled);
    }

    #[test]
    fn test_into_io_error_keeps_errno() {
        let err: io::Error = IoError::from_errno(libc::EBADF).into();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));

        let err: io::Error = IoError::NotInTask.into();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }
}
