use crate::task::current;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Yields execution back to the scheduler.
///
/// The task is suspended without a request and resumed on the next
/// scheduling pass, after tasks that were already runnable.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }

        self.yielded = true;
        if let Some(cur) = current::current() {
            cur.io.borrow_mut().yield_now();
        }

        Poll::Pending
    }
}
