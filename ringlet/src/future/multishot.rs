use crate::context::PooledBuf;
use crate::future::op::OpState;
use crate::sqe::{Completion, IoError, Marker, Request};
use futures::Stream;
use pin_project::{pin_project, pinned_drop};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Turns one completion into a stream item. `None` ends the stream.
pub(crate) type DecodeItem<T> = fn(Completion, Option<PooledBuf>) -> Option<Result<T, IoError>>;

/// A multishot request: one submission, one item per completion.
///
/// The stream ends after the first completion without the "more" flag.
/// Dropping it cancels the request in the kernel.
#[pin_project(PinnedDrop)]
#[must_use = "streams do nothing unless polled"]
pub struct Multishot<T> {
    state: OpState,
    decode: DecodeItem<T>,
}

impl<T> Multishot<T> {
    pub(crate) fn new(request: Request, decode: DecodeItem<T>) -> Self {
        debug_assert!(request.is_multishot());
        Self {
            state: OpState::new(request),
            decode,
        }
    }

    pub fn with(mut self, marker: Marker) -> Self {
        self.state.apply(marker);
        self
    }
}

impl<T> Stream for Multishot<T> {
    type Item = Result<T, IoError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match std::mem::replace(this.state, OpState::Done) {
            OpState::Unsubmitted(request) => match OpState::stash(request) {
                Ok(state) => {
                    *this.state = state;
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Some(Err(e))),
            },

            OpState::Invalid(e) => Poll::Ready(Some(Err(e.into()))),

            OpState::Submitted { io, ticket } => {
                let delivery = io.borrow_mut().take_delivery(ticket);
                let Some(delivery) = delivery else {
                    *this.state = OpState::Submitted { io, ticket };
                    return Poll::Pending;
                };

                if delivery.completion.has_more() {
                    *this.state = OpState::Submitted { io, ticket };
                }

                let item = (*this.decode)(delivery.completion, delivery.buffer);
                if item.is_none() {
                    // Decoder ended the stream early, stop listening.
                    this.state.forget();
                    *this.state = OpState::Done;
                }

                Poll::Ready(item)
            }

            OpState::Done => Poll::Ready(None),
        }
    }
}

#[pinned_drop]
impl<T> PinnedDrop for Multishot<T> {
    fn drop(self: Pin<&mut Self>) {
        self.state.forget();
    }
}

impl<T> fmt::Debug for Multishot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(self.state, OpState::Done);
        f.debug_struct("Multishot").field("done", &done).finish()
    }
}
