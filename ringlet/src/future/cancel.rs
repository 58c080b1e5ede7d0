use crate::future::op::Op;
use crate::sqe::{CancelTarget, Completion, IoError, Request, Target};
use crate::task::Id;

/// Outcome of a cancellation, async or synchronous.
///
/// `NotFound` and `AlreadyCompleting` are expected results of racing a
/// cancellation against the request's own completion, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Number of requests cancelled. A single-target cancel reports 0.
    Cancelled(u32),
    /// `-ENOENT`: no matching request, it already completed or never existed.
    NotFound,
    /// `-EALREADY`: the request was found but is already completing.
    AlreadyCompleting,
    /// Any other errno, positive.
    Failed(i32),
}

impl CancelOutcome {
    pub fn from_raw(result: i32) -> Self {
        match result {
            n if n >= 0 => CancelOutcome::Cancelled(n as u32),
            n if n == -libc::ENOENT => CancelOutcome::NotFound,
            n if n == -libc::EALREADY => CancelOutcome::AlreadyCompleting,
            n => CancelOutcome::Failed(-n),
        }
    }

    /// The signed result code the kernel reported.
    pub fn raw(&self) -> i32 {
        match *self {
            CancelOutcome::Cancelled(n) => i32::try_from(n).unwrap_or(i32::MAX),
            CancelOutcome::NotFound => -libc::ENOENT,
            CancelOutcome::AlreadyCompleting => -libc::EALREADY,
            CancelOutcome::Failed(errno) => -errno,
        }
    }

    /// Success or an in-progress cancellation.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            CancelOutcome::Cancelled(_) | CancelOutcome::AlreadyCompleting
        )
    }
}

fn decode(completion: Completion, _: Request) -> Result<CancelOutcome, IoError> {
    Ok(CancelOutcome::from_raw(completion.result()))
}

/// Cancels the request in flight for task `id`.
pub fn cancel(id: Id, match_all: bool) -> Op<CancelOutcome> {
    Op::new(Request::cancel(CancelTarget::Task(id), match_all), decode)
}

/// Cancels requests operating on `target`, the first match unless
/// `match_all` is set.
pub fn cancel_fd(target: impl Into<Target>, match_all: bool) -> Op<CancelOutcome> {
    Op::new(
        Request::cancel(CancelTarget::Fd(target.into()), match_all),
        decode,
    )
}

/// Cancels outstanding requests on the calling context's ring. The kernel
/// reports how many were cancelled.
pub fn cancel_any(match_all: bool) -> Op<CancelOutcome> {
    Op::new(Request::cancel(CancelTarget::Any, match_all), decode)
}
