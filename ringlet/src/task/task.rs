use crate::runtime::Handle;
use crate::task::{
    CurrentGuard, Id, JoinCell, JoinError, JoinHandle, JoinSink, ResumeError, TaskIo,
};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Why a started task is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    /// Waiting for the completion of its request.
    Io,
    /// Nested await on another task.
    Child(Id),
    /// Gave up its turn, resumed on the next scheduling pass.
    Yield,
}

/// Task lifecycle.
///
/// `Created → Running ⇄ Suspended → Done`, with `Cancelled` as an alternate
/// terminal state reachable before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Running,
    Suspended(Suspension),
    Done,
    Cancelled,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Cancelled)
    }
}

pub(crate) enum Outcome {
    Completed,
    Panicked(String),
}

/// An owned, resumable computation.
///
/// Parent and child links are task ids resolved through the scheduler's
/// tables, never owning references.
pub(crate) struct Task {
    id: Id,
    state: State,
    future: Pin<Box<dyn Future<Output = ()>>>,
    io: TaskIo,
    join: Rc<dyn JoinSink>,
    parent: Option<Id>,
    child: Option<Id>,
}

impl Task {
    pub(crate) fn new<F>(future: F, handle: Handle) -> (Task, JoinHandle<F::Output>)
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let id = Id::next();
        let cell = Rc::new(JoinCell::new());

        let output = cell.clone();
        let future = Box::pin(async move {
            let value = future.await;
            output.complete(Ok(value));
        });

        let task = Task {
            id,
            state: State::Created,
            future,
            io: TaskIo::default(),
            join: cell.clone(),
            parent: None,
            child: None,
        };

        (task, JoinHandle::new(id, cell, handle))
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn io(&self) -> &TaskIo {
        &self.io
    }

    pub(crate) fn parent(&self) -> Option<Id> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: Id) {
        self.parent = Some(parent);
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.join.is_detached()
    }

    pub(crate) fn suspend(&mut self, suspension: Suspension) {
        if let Suspension::Child(child) = suspension {
            self.child = Some(child);
        }
        self.state = State::Suspended(suspension);
    }

    /// Runs the computation until it suspends or finishes.
    ///
    /// Panics raised by the computation are caught and attached to the task's
    /// join handle, they never unwind into the scheduler.
    pub(crate) fn resume(&mut self) -> Result<Poll<Outcome>, ResumeError> {
        if self.state.is_terminal() {
            return Err(ResumeError::AlreadyDone(self.id));
        }

        self.state = State::Running;
        self.child = None;

        let result = {
            let _guard = CurrentGuard::enter(self.id, &self.io);
            let mut cx = Context::from_waker(futures::task::noop_waker_ref());
            let future = self.future.as_mut();

            panic::catch_unwind(AssertUnwindSafe(move || future.poll(&mut cx)))
        };

        match result {
            Ok(Poll::Pending) => Ok(Poll::Pending),
            Ok(Poll::Ready(())) => {
                self.state = State::Done;
                Ok(Poll::Ready(Outcome::Completed))
            }
            Err(payload) => {
                self.state = State::Done;
                let err = JoinError::panic(self.id, payload);
                let message = err.to_string();
                self.join.fail(err);
                Ok(Poll::Ready(Outcome::Panicked(message)))
            }
        }
    }

    /// Moves the task to `Cancelled` and wakes its join handle with
    /// [`JoinError::Cancelled`].
    pub(crate) fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        self.state = State::Cancelled;
        self.join.fail(JoinError::Cancelled(self.id));
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // Dropped before finishing, e.g. at context shutdown.
        if self.state != State::Done {
            self.join.fail(JoinError::Cancelled(self.id));
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("child", &self.child)
            .finish()
    }
}
