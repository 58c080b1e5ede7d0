use crate::task::current;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// User data tag reserved for requests issued by the runtime itself (abort
/// cancellations). Task ids never have this bit set.
pub(crate) const INTERNAL_USER_DATA_BIT: u64 = 1 << 63;

/// An opaque ID that uniquely identifies a task.
///
/// The id doubles as the correlation id of the request the task has in
/// flight: it is stored in the submission's `user_data` and comes back on
/// the completion. Ids are never reused within a process.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(NonZeroU64);

/// Returns the [`Id`] of the currently running task.
///
/// # Panics
///
/// This function panics if called from outside a task. For a version that
/// doesn't panic, see [`task::try_id()`](crate::task::try_id()).
pub fn id() -> Id {
    try_id().expect("Can't get a task id when not inside a task")
}

/// Returns the [`Id`] of the currently running task, or `None` if called
/// outside of a task.
pub fn try_id() -> Option<Id> {
    current::current().map(|cur| cur.id)
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        if id & INTERNAL_USER_DATA_BIT != 0 {
            Self::exhausted();
        }

        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }

    /// Maps a completion's `user_data` back to a task id. Runtime-internal
    /// tags map to `None`.
    pub(crate) fn from_user_data(user_data: u64) -> Option<Self> {
        if user_data & INTERNAL_USER_DATA_BIT != 0 {
            return None;
        }

        NonZeroU64::new(user_data).map(Self)
    }
}
