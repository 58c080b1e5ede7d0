use crate::sqe::IoError;
use bitflags::bitflags;
use io_uring::cqueue;

bitflags! {
    /// Request specific information carried in the completion flags field.
    /// Unknown bits, such as the selected buffer id, are kept as is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CompletionFlags: u32 {
        /// The upper 16 bits carry the id of the buffer the kernel picked.
        const BUFFER = 1 << 0;
        /// More completions follow for this request.
        const MORE = 1 << 1;
        /// The socket still had data left when the request completed.
        const SOCK_NONEMPTY = 1 << 2;
        /// Zero-copy notification.
        const NOTIF = 1 << 3;
    }
}

/// One kernel-delivered outcome, correlated back to its request through
/// `user_data`.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    user_data: u64,
    result: i32,
    flags: CompletionFlags,
}

impl Completion {
    pub(crate) fn new(user_data: u64, result: i32, flags: CompletionFlags) -> Self {
        Self {
            user_data,
            result,
            flags,
        }
    }

    pub(crate) fn from_cqe(cqe: &cqueue::Entry) -> Self {
        Self::new(
            cqe.user_data(),
            cqe.result(),
            CompletionFlags::from_bits_retain(cqe.flags()),
        )
    }

    /// A completion produced by the runtime itself, e.g. when a request could
    /// not be pushed to the submission queue.
    pub(crate) fn synthetic(user_data: u64, errno: i32) -> Self {
        Self::new(user_data, -errno, CompletionFlags::empty())
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Signed result code: `>= 0` on success, negated errno on failure.
    pub fn result(&self) -> i32 {
        self.result
    }

    pub fn flags(&self) -> CompletionFlags {
        self.flags
    }

    /// `IORING_CQE_F_MORE`: the request stays armed and more completions follow.
    pub fn has_more(&self) -> bool {
        cqueue::more(self.flags.bits())
    }

    /// Buffer id selected by the kernel from a provided buffer ring, if any.
    pub fn buffer_id(&self) -> Option<u16> {
        cqueue::buffer_select(self.flags.bits())
    }

    pub fn into_result(self) -> Result<u32, IoError> {
        if self.result < 0 {
            Err(IoError::from_errno(-self.result))
        } else {
            Ok(self.result as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_result_keeps_errno() {
        let cqe = Completion::synthetic(7, libc::ECANCELED);
        assert_eq!(cqe.user_data(), 7);
        assert_eq!(cqe.result(), -libc::ECANCELED);
        assert!(!cqe.has_more());
        assert_eq!(
            cqe.into_result().unwrap_err().raw_os_error(),
            Some(libc::ECANCELED)
        );
    }

    #[test]
    fn test_more_flag() {
        let cqe = Completion::new(1, 3, CompletionFlags::MORE);
        assert!(cqe.has_more());
        assert_eq!(cqe.buffer_id(), None);
        assert_eq!(cqe.into_result().ok(), Some(3));
    }
}
