use crate::task::{Id, TaskIo};
use std::cell::RefCell;

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

/// The task being polled on this thread, visible to request-bound futures
/// for the duration of one resume.
#[derive(Clone)]
pub(crate) struct Current {
    pub(crate) id: Id,
    pub(crate) io: TaskIo,
}

pub(crate) fn current() -> Option<Current> {
    CURRENT
        .try_with(|cur| cur.borrow().clone())
        .ok()
        .flatten()
}

/// Sets the current task while it is polled and restores the previous one
/// on drop, including on unwind.
pub(crate) struct CurrentGuard {
    prev: Option<Current>,
}

impl CurrentGuard {
    pub(crate) fn enter(id: Id, io: &TaskIo) -> Self {
        let prev = CURRENT.with(|cur| {
            cur.borrow_mut().replace(Current {
                id,
                io: io.clone(),
            })
        });

        CurrentGuard { prev }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        let _ = CURRENT.try_with(|cur| *cur.borrow_mut() = prev);
    }
}
