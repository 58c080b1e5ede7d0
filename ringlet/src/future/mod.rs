mod cancel;
pub use cancel::{CancelOutcome, cancel, cancel_any, cancel_fd};

mod multishot;
pub use multishot::Multishot;

mod op;
pub use op::Op;

pub(crate) mod ops;
