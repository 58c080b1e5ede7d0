use crate::runtime::Handle;
use crate::task::{Id, JoinError, current};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

enum JoinState<T> {
    Pending,
    Ready(Result<T, JoinError>),
    Taken,
}

/// Output slot shared by a task and its [`JoinHandle`].
pub(crate) struct JoinCell<T> {
    state: RefCell<JoinState<T>>,
    detached: Cell<bool>,
}

impl<T> JoinCell<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: RefCell::new(JoinState::Pending),
            detached: Cell::new(false),
        }
    }

    /// First writer wins.
    pub(crate) fn complete(&self, result: Result<T, JoinError>) {
        let mut state = self.state.borrow_mut();
        if matches!(*state, JoinState::Pending) {
            *state = JoinState::Ready(result);
        }
    }

    fn take(&self) -> Option<Result<T, JoinError>> {
        let mut state = self.state.borrow_mut();
        match std::mem::replace(&mut *state, JoinState::Taken) {
            JoinState::Ready(result) => Some(result),
            other => {
                *state = other;
                None
            }
        }
    }

    fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), JoinState::Pending)
    }
}

/// Type-erased view of a [`JoinCell`] kept by the task.
pub(crate) trait JoinSink {
    fn fail(&self, err: JoinError);

    /// No [`JoinHandle`] observes this task anymore.
    fn is_detached(&self) -> bool;
}

impl<T> JoinSink for JoinCell<T> {
    fn fail(&self, err: JoinError) {
        self.complete(Err(err));
    }

    fn is_detached(&self) -> bool {
        self.detached.get()
    }
}

/// An owned permission to join on a task (await its termination).
///
/// Awaiting a `JoinHandle` from inside another task is a nested await: the
/// scheduler resumes the awaiting task once this one reaches a terminal
/// state, without involving the kernel queue.
///
/// Dropping the handle detaches the task. A detached task that panics is
/// treated as fatal by the context.
///
/// # Panics
///
/// Awaiting a handle outside of a task panics, as there is no scheduler to
/// resume the awaiting side. Use [`JoinHandle::try_take`] there instead.
pub struct JoinHandle<T> {
    id: Id,
    cell: Rc<JoinCell<T>>,
    handle: Handle,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(id: Id, cell: Rc<JoinCell<T>>, handle: Handle) -> Self {
        Self { id, cell, handle }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Whether the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        !self.cell.is_pending()
    }

    /// Moves the task to `Cancelled`. Its outstanding request, if any, is
    /// cancelled in the kernel. Returns `false` if the task already finished.
    pub fn abort(&self) -> bool {
        self.handle.abort(self.id)
    }

    /// Takes the output without waiting.
    pub fn try_take(&mut self) -> Option<Result<T, JoinError>> {
        self.cell.take()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.cell.take() {
            return Poll::Ready(result);
        }

        assert!(
            self.cell.is_pending(),
            "JoinHandle polled after its output was taken"
        );

        let cur = current::current().expect("JoinHandle must be awaited from within a task");
        cur.io.borrow_mut().wait_on(self.id);

        Poll::Pending
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        self.cell.detached.set(true);
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
