//! A single-threaded io_uring runtime.
//!
//! Each [`Context`](runtime::Context) owns one kernel queue and drives the
//! tasks spawned on it. Awaiting a request-bound future suspends the task
//! until the completion carrying its correlation id comes back.

mod context;

mod future;
pub use future::Op;

pub mod runtime;

pub mod sqe;

pub mod task;

mod utils;

/// Request-bound futures, one per supported operation.
pub mod ops {
    pub use crate::future::Multishot;
    pub use crate::future::ops::*;
}

/// Async and synchronous cancellation.
pub mod cancel {
    pub use crate::future::{CancelOutcome, cancel, cancel_any, cancel_fd};
    pub use crate::sqe::CancelTarget;
}

/// The provided buffer ring used by multishot receives.
pub mod buffer {
    pub use crate::context::{Bid, BufferPool, BufferPoolConfig, BufferPoolError, PooledBuf};
}

#[cfg(test)]
mod test_utils;
