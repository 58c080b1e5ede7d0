//! Tasks: owned, lazily-started computations resumed by a context.

mod current;
pub(crate) use current::{CurrentGuard, current};

mod error;
pub use error::{JoinError, ResumeError};

mod id;
pub use id::{Id, id, try_id};
pub(crate) use id::INTERNAL_USER_DATA_BIT;

mod io;
pub(crate) use io::{TaskIo, Ticket};

mod join;
pub use join::JoinHandle;
pub(crate) use join::{JoinCell, JoinSink};

#[allow(clippy::module_inception)]
mod task;
pub use task::{State, Suspension};
pub(crate) use task::{Outcome, Task};

mod yield_now;
pub use yield_now::{YieldNow, yield_now};
