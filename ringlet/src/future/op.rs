use crate::sqe::{Completion, IoError, Marker, OpcodeError, Request};
use crate::task::{TaskIo, Ticket, current};
use anyhow::anyhow;
use pin_project::{pin_project, pinned_drop};
use std::fmt;
use std::ops::BitOr;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Turns the final completion, plus the request handed back by the kernel,
/// into the operation's output.
pub(crate) type Decode<T> = fn(Completion, Request) -> Result<T, IoError>;

pub(crate) enum OpState {
    Unsubmitted(Request),
    Invalid(OpcodeError),
    Submitted { io: TaskIo, ticket: Ticket },
    Done,
}

impl OpState {
    pub(crate) fn new(request: Request) -> Self {
        match request.validate() {
            Ok(()) => OpState::Unsubmitted(request),
            Err(e) => OpState::Invalid(e),
        }
    }

    pub(crate) fn from_result(request: Result<Request, OpcodeError>) -> Self {
        request.map_or_else(OpState::Invalid, OpState::new)
    }

    /// Hands the request to the current task. The scheduler picks it up once
    /// the task suspends.
    pub(crate) fn stash(request: Request) -> Result<OpState, IoError> {
        let cur = current().ok_or(IoError::NotInTask)?;
        let ticket = cur
            .io
            .borrow_mut()
            .stash(request)
            .map_err(|_| IoError::Busy(cur.id))?;

        Ok(OpState::Submitted {
            io: cur.io,
            ticket,
        })
    }

    pub(crate) fn apply(&mut self, marker: Marker) {
        if let OpState::Unsubmitted(request) = self {
            *request |= marker;
        }
    }

    pub(crate) fn forget(&self) {
        if let OpState::Submitted { io, ticket } = self {
            io.borrow_mut().forget(*ticket);
        }
    }
}

/// A one-shot request awaiting its completion.
///
/// The first poll never completes: the request is stashed in the current
/// task and only submitted by the scheduler once the task suspends. The
/// task is resumed when the completion for its correlation id arrives.
///
/// Dropping an `Op` whose request is in flight asks the kernel to cancel it.
/// The request memory stays with the task until the kernel is done with it.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless awaited"]
pub struct Op<T> {
    state: OpState,
    decode: Decode<T>,
}

impl<T> Op<T> {
    pub(crate) fn new(request: Request, decode: Decode<T>) -> Self {
        Self {
            state: OpState::new(request),
            decode,
        }
    }

    pub(crate) fn try_new(request: Result<Request, OpcodeError>, decode: Decode<T>) -> Self {
        Self {
            state: OpState::from_result(request),
            decode,
        }
    }

    /// Combines the request with `marker`, see [`Marker`]. No effect once the
    /// request was submitted.
    pub fn with(mut self, marker: Marker) -> Self {
        self.state.apply(marker);
        self
    }
}

impl<T> BitOr<Marker> for Op<T> {
    type Output = Op<T>;

    fn bitor(self, rhs: Marker) -> Op<T> {
        self.with(rhs)
    }
}

impl<T> Future for Op<T> {
    type Output = Result<T, IoError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match std::mem::replace(this.state, OpState::Done) {
            OpState::Unsubmitted(request) => match OpState::stash(request) {
                Ok(state) => {
                    *this.state = state;
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(e)),
            },

            OpState::Invalid(e) => Poll::Ready(Err(e.into())),

            OpState::Submitted { io, ticket } => {
                let delivery = io.borrow_mut().take_delivery(ticket);
                let Some(delivery) = delivery else {
                    *this.state = OpState::Submitted { io, ticket };
                    return Poll::Pending;
                };

                let request = delivery
                    .request
                    .ok_or_else(|| anyhow!("one-shot request completed with more to come"))?;

                Poll::Ready((*this.decode)(delivery.completion, request))
            }

            OpState::Done => panic!("`Op` polled after completion"),
        }
    }
}

#[pinned_drop]
impl<T> PinnedDrop for Op<T> {
    fn drop(self: Pin<&mut Self>) {
        self.state.forget();
    }
}

impl<T> fmt::Debug for Op<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            OpState::Unsubmitted(request) => request.name(),
            OpState::Invalid(_) => "invalid",
            OpState::Submitted { .. } => "submitted",
            OpState::Done => "done",
        };
        f.debug_struct("Op").field("state", &state).finish()
    }
}
