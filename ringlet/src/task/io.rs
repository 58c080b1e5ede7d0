use crate::context::PooledBuf;
use crate::sqe::{Completion, Request};
use crate::task::{Id, Suspension};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Suspension bridge storage shared by a task and the futures it polls.
pub(crate) type TaskIo = Rc<RefCell<IoSlot>>;

/// Identifies one request issued by a task, so deliveries are only ever
/// consumed by the future that stashed the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ticket(u64);

/// A completion handed to the task, plus the resources it releases.
pub(crate) struct Delivery {
    pub(crate) completion: Completion,
    pub(crate) buffer: Option<PooledBuf>,
    /// Present on the final completion of the request.
    pub(crate) request: Option<Request>,
}

/// Reasons for a task suspended on its request to run before the kernel
/// answers: a child it awaits, or a yield.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EarlyWake {
    pub(crate) child: Option<Id>,
    pub(crate) yielded: bool,
}

struct InFlight {
    ticket: Ticket,
    request: Request,
    abandoned: bool,
}

/// Per-task request slot.
///
/// A request moves `pending` (stashed by a future, not submitted yet) →
/// `in_flight` (owned by the kernel) → `delivered` (final completion
/// received, request handed back). At most one request is in flight per
/// task.
#[derive(Default)]
pub(crate) struct IoSlot {
    next_ticket: u64,
    pending: Option<(Ticket, Request)>,
    in_flight: Option<InFlight>,
    delivered: VecDeque<(Ticket, Delivery)>,
    waiting_on: Option<Id>,
    yielded: bool,
    early_wake: EarlyWake,
    cancel_abandoned: bool,
    last_result: Option<i32>,
}

impl IoSlot {
    /// Stores `request` for the scheduler. Fails, returning the request, if
    /// the task already has one outstanding.
    pub(crate) fn stash(&mut self, request: Request) -> Result<Ticket, Request> {
        if self.pending.is_some() || self.has_live_request() {
            return Err(request);
        }

        self.next_ticket += 1;
        let ticket = Ticket(self.next_ticket);
        self.pending = Some((ticket, request));

        Ok(ticket)
    }

    /// Takes the stashed request, unless the previous one is still owned by
    /// the kernel. In that case it stays queued until the kernel lets go.
    pub(crate) fn take_submittable(&mut self) -> Option<(Ticket, Request)> {
        if self.in_flight.is_some() {
            return None;
        }

        self.pending.take()
    }

    pub(crate) fn set_in_flight(&mut self, ticket: Ticket, request: Request) {
        debug_assert!(self.in_flight.is_none(), "task already has a request in flight");
        self.in_flight = Some(InFlight {
            ticket,
            request,
            abandoned: false,
        });
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub(crate) fn take_in_flight(&mut self) -> Option<Request> {
        self.in_flight.take().map(|f| f.request)
    }

    /// Whether the future awaiting the in-flight request was dropped since
    /// the last call. The scheduler answers by cancelling it in the kernel.
    pub(crate) fn take_cancel_request(&mut self) -> bool {
        std::mem::take(&mut self.cancel_abandoned)
    }

    /// Stores a completion for the in-flight request. Returns `false` when no
    /// future is waiting for it, in which case the completion and any buffer
    /// it carries are released immediately.
    pub(crate) fn deliver(&mut self, completion: Completion, buffer: Option<PooledBuf>) -> bool {
        self.last_result = Some(completion.result());

        let Some(in_flight) = self.in_flight.as_ref() else {
            return false;
        };

        let ticket = in_flight.ticket;
        let abandoned = in_flight.abandoned;

        let request = if completion.has_more() {
            None
        } else {
            self.in_flight.take().map(|f| f.request)
        };

        if abandoned {
            return false;
        }

        self.delivered.push_back((
            ticket,
            Delivery {
                completion,
                buffer,
                request,
            },
        ));

        true
    }

    pub(crate) fn take_delivery(&mut self, ticket: Ticket) -> Option<Delivery> {
        match self.delivered.front() {
            Some((front, _)) if *front == ticket => self.delivered.pop_front().map(|(_, d)| d),
            _ => None,
        }
    }

    /// Called when the future owning `ticket` is dropped.
    pub(crate) fn forget(&mut self, ticket: Ticket) {
        self.delivered.retain(|(t, _)| *t != ticket);

        if self.pending.as_ref().is_some_and(|(t, _)| *t == ticket) {
            self.pending = None;
        }

        if let Some(in_flight) = self.in_flight.as_mut()
            && in_flight.ticket == ticket
            && !in_flight.abandoned
        {
            in_flight.abandoned = true;
            self.cancel_abandoned = true;
        }
    }

    pub(crate) fn wait_on(&mut self, child: Id) {
        self.waiting_on = Some(child);
    }

    pub(crate) fn yield_now(&mut self) {
        self.yielded = true;
    }

    /// Classifies why the task returned `Pending` from its last poll.
    ///
    /// A new request wins over everything else, but a child awaited or a
    /// yield in the same poll is kept as an [`EarlyWake`] for the scheduler.
    /// A task that still owns a live request (e.g. a multishot stream) but
    /// yielded or awaited a child is not parked on I/O: its completions are
    /// buffered until it resumes. Any other pending future is treated as a
    /// yield.
    pub(crate) fn suspension(&mut self) -> Suspension {
        let child = self.waiting_on.take();
        let yielded = std::mem::take(&mut self.yielded);
        self.early_wake = EarlyWake::default();

        if self.pending.is_some() {
            self.early_wake = EarlyWake { child, yielded };
            Suspension::Io
        } else if let Some(child) = child {
            Suspension::Child(child)
        } else if !yielded && self.has_live_request() {
            Suspension::Io
        } else {
            Suspension::Yield
        }
    }

    /// What else the last `Io` suspension was waiting for.
    pub(crate) fn take_early_wake(&mut self) -> EarlyWake {
        std::mem::take(&mut self.early_wake)
    }

    /// Result code of the last completion delivered to this task.
    pub(crate) fn last_result(&self) -> Option<i32> {
        self.last_result
    }

    fn has_live_request(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|f| !f.abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqe::CompletionFlags;

    fn submit(slot: &mut IoSlot, request: Request) -> Ticket {
        let ticket = slot.stash(request).ok().unwrap();
        let (t, req) = slot.take_submittable().unwrap();
        assert_eq!(t, ticket);
        slot.set_in_flight(t, req);
        ticket
    }

    #[test]
    fn test_single_request_per_task() {
        let mut slot = IoSlot::default();
        assert!(slot.stash(Request::nop()).is_ok());
        assert!(slot.stash(Request::nop()).is_err());
        assert_eq!(slot.suspension(), Suspension::Io);
    }

    #[test]
    fn test_final_delivery_returns_request() {
        let mut slot = IoSlot::default();
        let ticket = submit(&mut slot, Request::nop());

        assert!(slot.deliver(Completion::new(1, 0, CompletionFlags::empty()), None));
        assert!(!slot.has_in_flight());
        assert_eq!(slot.last_result(), Some(0));

        let delivery = slot.take_delivery(ticket).unwrap();
        assert!(delivery.request.is_some());
        assert!(slot.take_delivery(ticket).is_none());
    }

    #[test]
    fn test_multishot_keeps_request_in_flight() {
        let mut slot = IoSlot::default();
        let ticket = submit(&mut slot, Request::nop());

        assert!(slot.deliver(Completion::new(1, 5, CompletionFlags::MORE), None));
        assert!(slot.has_in_flight());
        assert!(slot.take_delivery(ticket).unwrap().request.is_none());

        assert!(slot.deliver(Completion::new(1, 6, CompletionFlags::empty()), None));
        assert!(!slot.has_in_flight());
    }

    #[test]
    fn test_forgotten_request_stays_owned_until_final_completion() {
        let mut slot = IoSlot::default();
        let ticket = submit(&mut slot, Request::nop());

        slot.forget(ticket);
        assert!(slot.take_cancel_request());
        assert!(!slot.take_cancel_request());
        assert!(slot.has_in_flight());

        // A new request can be stashed but is held back until the kernel
        // releases the abandoned one.
        let next = slot.stash(Request::nop()).ok().unwrap();
        assert!(slot.take_submittable().is_none());

        assert!(!slot.deliver(Completion::new(1, 0, CompletionFlags::empty()), None));
        assert!(slot.take_delivery(ticket).is_none());

        let (t, _) = slot.take_submittable().unwrap();
        assert_eq!(t, next);
    }

    #[test]
    fn test_suspension_classification() {
        let mut slot = IoSlot::default();
        assert_eq!(slot.suspension(), Suspension::Yield);

        let child = Id::next();
        slot.wait_on(child);
        assert_eq!(slot.suspension(), Suspension::Child(child));
        assert_eq!(slot.suspension(), Suspension::Yield);
    }

    #[test]
    fn test_yield_with_live_request_is_not_io() {
        let mut slot = IoSlot::default();
        submit(&mut slot, Request::nop());
        assert_eq!(slot.suspension(), Suspension::Io);

        slot.yield_now();
        assert_eq!(slot.suspension(), Suspension::Yield);
        assert_eq!(slot.suspension(), Suspension::Io);
    }

    #[test]
    fn test_new_request_keeps_child_and_yield() {
        let mut slot = IoSlot::default();
        let child = Id::next();

        slot.stash(Request::nop()).ok().unwrap();
        slot.wait_on(child);
        slot.yield_now();
        assert_eq!(slot.suspension(), Suspension::Io);
        assert_eq!(
            slot.take_early_wake(),
            EarlyWake {
                child: Some(child),
                yielded: true
            }
        );
        assert_eq!(slot.take_early_wake(), EarlyWake::default());

        // Plain request suspensions carry nothing extra.
        assert_eq!(slot.suspension(), Suspension::Io);
        assert_eq!(slot.take_early_wake(), EarlyWake::default());
    }

    #[test]
    fn test_completion_without_request_is_dropped() {
        let mut slot = IoSlot::default();
        assert!(!slot.deliver(Completion::new(9, 0, CompletionFlags::empty()), None));
    }
}
