//! The scheduler behind a [`Context`](crate::runtime::Context): the kernel
//! queue, the buffer pool and the task tables, plus the loop correlating
//! completions back to tasks.

use crate::future::CancelOutcome;
use crate::runtime::{Handle, RuntimeConfig, RuntimeError};
use crate::sqe::{CancelTarget, Completion, OpcodeError, Request};
use crate::task::{
    INTERNAL_USER_DATA_BIT, Id, JoinHandle, Outcome, Suspension, Task, TaskIo, Ticket, try_id,
};
use crate::utils::ScopeGuard;
use crate::utils::thread::set_current_thread_name;
use anyhow::anyhow;
use io_uring::opcode;
use io_uring::types::CancelBuilder;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::task::Poll;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

mod buffer_pool;
pub use buffer_pool::{Bid, BufferPool, BufferPoolConfig, BufferPoolError, PooledBuf};
pub(crate) use buffer_pool::MAX_RING_ENTRIES;

mod ring;
pub(crate) use ring::SingleIssuerRing;

mod shared;

mod table;
use table::TaskTable;

#[cfg(test)]
mod tests;

// Used wherever we rely on SmallVec to store entries on stack first.
// Prevent most heap allocations.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;

pub(crate) type Completions = SmallVec<[Completion; SPILL_TO_HEAP_THRESHOLD]>;

// Use a thread_local variable to track if a context is already active on this thread.
thread_local! {
    static IS_CONTEXT_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Why `drive` returned.
enum Exit {
    Done,
    Stopped,
}

/// What to do with a task whose request produced a completion.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Resume,
    Store,
}

pub(crate) struct Scheduler {
    cfg: RuntimeConfig,

    ring: RefCell<SingleIssuerRing>,

    pool: Option<Rc<RefCell<BufferPool>>>,

    tasks: RefCell<TaskTable>,

    /// Requests pushed to the kernel whose final completion was not seen yet,
    /// including internal cancellations and orphans.
    outstanding: Cell<usize>,

    next_internal: Cell<u64>,

    stopped: Cell<bool>,
    shut_down: Cell<bool>,

    /// Error that ends the current `drive`.
    fatal: RefCell<Option<RuntimeError>>,
}

impl Scheduler {
    pub(crate) fn try_new(cfg: RuntimeConfig) -> Result<Rc<Self>, RuntimeError> {
        IS_CONTEXT_ACTIVE.with(|is_active| {
            if is_active.replace(true) {
                Err(RuntimeError::Other(anyhow!(
                    "Cannot create a new Context: a context is already active on this thread."
                )))
            } else {
                Ok(())
            }
        })?;

        let mut release = ScopeGuard::new(|| IS_CONTEXT_ACTIVE.with(|a| a.set(false)));

        if let Some(name) = &cfg.thread_name {
            set_current_thread_name(name);
        }

        let ring = shared::init_ring(&cfg)?;
        let pool = Self::init_pool(&cfg, &ring);

        release.disarm();

        debug!(
            sq_ring_size = cfg.sq_ring_size,
            degraded = ring.is_degraded(),
            buffer_pool = pool.is_some(),
            "context ready"
        );

        Ok(Rc::new(Scheduler {
            cfg,
            ring: RefCell::new(ring),
            pool,
            tasks: RefCell::new(TaskTable::default()),
            outstanding: Cell::new(0),
            next_internal: Cell::new(0),
            stopped: Cell::new(false),
            shut_down: Cell::new(false),
            fatal: RefCell::new(None),
        }))
    }

    // Best-effort: without a pool, multishot receives fail with ENOBUFS.
    fn init_pool(cfg: &RuntimeConfig, ring: &SingleIssuerRing) -> Option<Rc<RefCell<BufferPool>>> {
        if !cfg.buffer_pool_enabled() {
            return None;
        }

        let mut pool = match BufferPool::try_new(&cfg.buffer_pool) {
            Ok(pool) => pool,
            Err(e) => {
                warn!(error = %e, "failed to allocate buffer pool");
                return None;
            }
        };

        if let Err(e) = pool.register(ring) {
            warn!(bgid = cfg.buffer_pool.bgid, error = %e, "failed to register buffer pool");
            return None;
        }

        Some(Rc::new(RefCell::new(pool)))
    }

    pub(crate) fn spawn<F>(self: &Rc<Self>, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let (task, join) = Task::new(future, Handle::new(Rc::downgrade(self)));

        if self.shut_down.get() {
            // Dropping an unstarted task cancels its join handle.
            drop(task);
        } else {
            trace!(id = %task.id(), "spawned task");
            self.tasks.borrow_mut().push_pending(task);
        }

        join
    }

    pub(crate) fn block_on<F>(self: &Rc<Self>, future: F) -> Result<F::Output, RuntimeError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let mut join = self.spawn(future);

        match self.drive(|| join.is_finished(), true)? {
            Exit::Done => {}
            Exit::Stopped => return Err(RuntimeError::Stopped),
        }

        match join.try_take() {
            Some(result) => Ok(result?),
            None => Err(RuntimeError::Stopped),
        }
    }

    pub(crate) fn run(&self) -> Result<(), RuntimeError> {
        match self.drive(|| false, false)? {
            Exit::Done | Exit::Stopped => Ok(()),
        }
    }

    pub(crate) fn stop(&self) {
        self.stopped.set(true);
    }

    pub(crate) fn abort(&self, id: Id) -> bool {
        let task = self.tasks.borrow_mut().take(id);

        match task {
            Some(task) => {
                self.cancel_task(task);
                true
            }
            // Aborting the running task, it is cancelled once it suspends.
            None if try_id() == Some(id) => {
                self.tasks.borrow_mut().mark_aborting(id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_sync(
        &self,
        target: CancelTarget,
        match_all: bool,
        timeout: Duration,
    ) -> CancelOutcome {
        let builder = match target.to_builder(match_all) {
            Ok(builder) => builder,
            Err(e) => {
                debug!(?target, error = %e, "invalid synchronous cancel target");
                return CancelOutcome::from_raw(-libc::EINVAL);
            }
        };

        let res = self.ring.borrow().sync_cancel(builder, Some(timeout));
        match res {
            Ok(()) => CancelOutcome::from_raw(0),
            Err(e) => CancelOutcome::from_raw(-e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    pub(crate) fn with_buffer_pool<R>(&self, f: impl FnOnce(&mut BufferPool) -> R) -> Option<R> {
        self.pool.as_ref().map(|pool| f(&mut pool.borrow_mut()))
    }

    /// The loop: start pending tasks, resume ready ones, submit, wait for at
    /// least one completion and hand each completion to its task.
    fn drive(&self, mut until: impl FnMut() -> bool, deadlock_is_error: bool) -> Result<Exit, RuntimeError> {
        self.stopped.set(false);
        let mut completions = Completions::new();

        loop {
            if let Some(err) = self.fatal.borrow_mut().take() {
                return Err(err);
            }

            if until() {
                return Ok(Exit::Done);
            }

            if self.stopped.get() {
                return Ok(Exit::Stopped);
            }

            self.schedule_tasks();

            if let Some(err) = self.fatal.borrow_mut().take() {
                return Err(err);
            }

            if until() {
                return Ok(Exit::Done);
            }

            let idle = self.tasks.borrow().is_idle();
            if idle && self.outstanding.get() == 0 && deadlock_is_error {
                return Err(RuntimeError::Deadlock);
            }

            let res = if idle {
                self.ring
                    .borrow_mut()
                    .submit_and_wait(1, Some(self.cfg.wait_timeout))
            } else {
                self.ring.borrow_mut().submit_and_get_events()
            };

            match res {
                Ok(_) => {}
                Err(e) if matches!(e.raw_os_error(), Some(libc::EINTR | libc::EBUSY | libc::EAGAIN)) => {}
                Err(e) => {
                    error!(error = %e, "failed to submit to the kernel queue");
                    return Err(RuntimeError::Io(e));
                }
            }

            self.ring.borrow_mut().reap_into(&mut completions);
            for completion in completions.drain(..) {
                self.process_completion(completion, Delivery::Resume);
            }
        }
    }

    fn schedule_tasks(&self) {
        // New tasks start in spawn order, including those spawned meanwhile.
        loop {
            let task = self.tasks.borrow_mut().pop_pending();
            let Some(task) = task else {
                break;
            };

            self.resume(task);
        }

        // Only tasks that were ready when the pass began, a task yielding in
        // a loop must not starve completions.
        let num_ready = self.tasks.borrow().ready_len();
        for _ in 0..num_ready {
            let task = {
                let mut tasks = self.tasks.borrow_mut();
                tasks
                    .pop_ready()
                    .and_then(|id| tasks.take_parked(id).or_else(|| tasks.take_in_flight(id)))
            };

            if let Some(task) = task {
                self.resume(task);
            }
        }
    }

    fn resume(&self, mut task: Task) {
        let id = task.id();
        let res = task.resume();
        let aborted = self.tasks.borrow_mut().take_aborting(id);

        match res {
            Ok(Poll::Ready(outcome)) => self.finish(task, outcome),
            Ok(Poll::Pending) if aborted => self.cancel_task(task),
            Ok(Poll::Pending) => self.park(task),
            Err(e) => {
                debug_assert!(false, "{e}");
                error!(%id, error = %e, "resumed a finished task");
            }
        }
    }

    /// Files a task that returned `Pending` under the reason it suspended.
    fn park(&self, mut task: Task) {
        let id = task.id();
        let suspension = task.io().borrow_mut().suspension();
        task.suspend(suspension);

        self.flush_io(id, task.io());

        match suspension {
            Suspension::Io => {
                let early = task.io().borrow_mut().take_early_wake();
                let mut wake = early.yielded;

                if let Some(child) = early.child
                    && !self.tasks.borrow_mut().link_parent(child, id)
                {
                    wake = true;
                }

                if wake {
                    // Resumed on the next pass even though its request
                    // stays with the kernel.
                    self.tasks.borrow_mut().push_ready(id);
                }
                self.requeue(task);
            }
            Suspension::Child(child) => {
                let mut tasks = self.tasks.borrow_mut();
                if !tasks.link_parent(child, id) {
                    // Child already gone, its join handle is ready.
                    tasks.push_ready(id);
                }
                tasks.insert_parked(task);
            }
            Suspension::Yield => {
                let mut tasks = self.tasks.borrow_mut();
                tasks.push_ready(id);
                tasks.insert_parked(task);
            }
        }
    }

    /// Waits on the kernel if the task has a request there, otherwise makes
    /// it ready so it can observe its result. A ready task waiting on the
    /// kernel is resumed by whichever comes first.
    fn requeue(&self, task: Task) {
        let waiting = task.io().borrow().has_in_flight();
        let mut tasks = self.tasks.borrow_mut();

        if waiting {
            tasks.insert_in_flight(task);
        } else {
            tasks.push_ready(task.id());
            tasks.insert_parked(task);
        }
    }

    /// Cancels an abandoned request and submits the stashed one, if any.
    fn flush_io(&self, id: Id, io: &TaskIo) {
        let (cancel, submittable) = {
            let mut io = io.borrow_mut();
            (io.take_cancel_request(), io.take_submittable())
        };

        if cancel {
            trace!(%id, "cancelling abandoned request");
            self.cancel_internal(CancelBuilder::user_data(id.as_u64()));
        }

        if let Some((ticket, request)) = submittable {
            self.submit(id, io, ticket, request);
        }
    }

    /// Tags `request` with the task's correlation id and pushes it. Requests
    /// that cannot be pushed complete immediately with a synthetic error.
    fn submit(&self, id: Id, io: &TaskIo, ticket: Ticket, mut request: Request) {
        if request.needs_buffer_group() {
            match &self.pool {
                Some(pool) => request.set_buffer_group(pool.borrow().bgid()),
                None => return Self::fail_request(id, io, ticket, request, libc::ENOBUFS),
            }
        }

        let entry = match request.to_entry(id.as_u64()) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(%id, op = request.name(), error = %e, "failed to encode request");
                let errno = match e {
                    OpcodeError::UnsupportedTarget(_) => libc::EBADF,
                    _ => libc::EINVAL,
                };
                return Self::fail_request(id, io, ticket, request, errno);
            }
        };

        let pushed = self.ring.borrow_mut().push(&entry);
        match pushed {
            Ok(()) => {
                trace!(%id, op = request.name(), "submitted request");
                io.borrow_mut().set_in_flight(ticket, request);
                self.outstanding.set(self.outstanding.get() + 1);
            }
            Err(e) => {
                warn!(%id, op = request.name(), error = %e, "failed to push request");
                Self::fail_request(id, io, ticket, request, libc::EBUSY);
            }
        }
    }

    fn fail_request(id: Id, io: &TaskIo, ticket: Ticket, request: Request, errno: i32) {
        let mut io = io.borrow_mut();
        io.set_in_flight(ticket, request);
        io.deliver(Completion::synthetic(id.as_u64(), errno), None);
    }

    fn cancel_internal(&self, builder: CancelBuilder) {
        let seq = self.next_internal.get().wrapping_add(1);
        self.next_internal.set(seq);

        let entry = opcode::AsyncCancel2::new(builder)
            .build()
            .user_data(INTERNAL_USER_DATA_BIT | seq);

        let pushed = self.ring.borrow_mut().push(&entry);
        match pushed {
            Ok(()) => self.outstanding.set(self.outstanding.get() + 1),
            Err(e) => warn!(error = %e, "failed to push internal cancel"),
        }
    }

    fn process_completion(&self, completion: Completion, mode: Delivery) {
        let user_data = completion.user_data();

        let Some(id) = Id::from_user_data(user_data) else {
            if user_data & INTERNAL_USER_DATA_BIT != 0 {
                self.account(&completion);
                trace!(result = completion.result(), "internal cancel completed");
            } else {
                trace!(user_data, "ignoring completion with unknown id");
            }
            return;
        };

        let task = match mode {
            Delivery::Resume => self.tasks.borrow_mut().take_in_flight(id),
            Delivery::Store => None,
        };

        if let Some(task) = task {
            let buffer = self.account(&completion);
            let delivered = task.io().borrow_mut().deliver(completion, buffer);

            if delivered {
                self.resume(task);
            } else {
                // Completion of an abandoned request, the next one may be
                // waiting for it to be released.
                self.flush_io(id, task.io());
                self.requeue(task);
            }
            return;
        }

        let io = {
            let tasks = self.tasks.borrow();
            tasks
                .get_in_flight(id)
                .or_else(|| tasks.get_parked(id))
                .map(|task| task.io().clone())
        };

        if let Some(io) = io {
            let buffer = self.account(&completion);
            io.borrow_mut().deliver(completion, buffer);
            return;
        }

        if self.tasks.borrow().has_orphan(id) {
            // Claimed buffers go straight back to the pool on drop.
            drop(self.account(&completion));
            if !completion.has_more() {
                let request = self.tasks.borrow_mut().take_orphan(id);
                trace!(%id, "released orphaned request");
                drop(request);
            }
            return;
        }

        trace!(%id, "ignoring completion with unknown id");
    }

    /// Bookkeeping shared by every known completion: outstanding count and
    /// buffer pool selection.
    fn account(&self, completion: &Completion) -> Option<PooledBuf> {
        if !completion.has_more() {
            self.outstanding.set(self.outstanding.get().saturating_sub(1));
        }

        let pool = self.pool.as_ref()?;

        if completion.result() == -libc::ENOBUFS {
            pool.borrow_mut().expand_buffer();
        }

        let bid = Bid::new(completion.buffer_id()?);
        let len = completion.result().max(0) as usize;

        match pool.borrow_mut().claim(bid, len) {
            Ok(()) => Some(PooledBuf::new(Rc::downgrade(pool), bid, len)),
            Err(e) => {
                warn!(bid = bid.val(), error = %e, "kernel selected an unusable buffer");
                None
            }
        }
    }

    fn finish(&self, task: Task, outcome: Outcome) {
        let id = task.id();

        if let Some(parent) = task.parent() {
            self.tasks.borrow_mut().push_ready(parent);
        }

        if let Outcome::Panicked(message) = outcome {
            if task.is_detached() {
                error!(fatal = true, %id, %message, "detached task panicked");
                self.set_fatal(RuntimeError::UnhandledPanic { id, message });
            } else {
                debug!(%id, %message, "task panicked");
            }
        }

        self.orphan_request(&task);
        trace!(%id, last_result = ?task.io().borrow().last_result(), "task done");
        drop(task);
    }

    fn cancel_task(&self, mut task: Task) {
        let id = task.id();
        task.cancel();

        if let Some(parent) = task.parent() {
            self.tasks.borrow_mut().push_ready(parent);
        }

        self.orphan_request(&task);
        debug!(%id, "task aborted");
        drop(task);
    }

    /// Keeps the request of a task that is going away until the kernel
    /// releases it, and asks the kernel to cancel it.
    fn orphan_request(&self, task: &Task) {
        let request = task.io().borrow_mut().take_in_flight();
        if let Some(request) = request {
            let id = task.id();
            self.tasks.borrow_mut().insert_orphan(id, request);
            self.cancel_internal(CancelBuilder::user_data(id.as_u64()));
        }
    }

    fn set_fatal(&self, err: RuntimeError) {
        let mut fatal = self.fatal.borrow_mut();
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    /// Cancels everything, drains completions for at most the shutdown
    /// timeout, then drops every task. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.shut_down.replace(true) {
            return;
        }

        self.stopped.set(true);
        let timeout = self.cfg.shutdown_timeout;
        let deadline = Instant::now() + timeout;

        if self.outstanding.get() > 0 {
            // Entries still sitting in the submission queue are invisible to
            // the kernel's cancel lookup.
            if let Err(e) = self.ring.borrow_mut().submit_and_get_events() {
                warn!(error = %e, "failed to flush the submission queue");
            }

            let res = self.ring.borrow().sync_cancel(CancelBuilder::any(), Some(timeout));
            match res {
                Ok(()) => {}
                Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT | libc::ETIME)) => {}
                Err(e) => {
                    warn!(error = %e, "synchronous cancel failed, falling back to async cancel");
                    self.cancel_internal(CancelBuilder::any());
                }
            }
        }

        let mut completions = Completions::new();
        while self.outstanding.get() > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let wait = deadline.duration_since(now).min(self.cfg.wait_timeout);
            let res = self.ring.borrow_mut().submit_and_wait(1, Some(wait));
            if let Err(e) = res
                && e.raw_os_error() != Some(libc::EINTR)
            {
                warn!(error = %e, "failed to drain the kernel queue");
                break;
            }

            self.ring.borrow_mut().reap_into(&mut completions);
            for completion in completions.drain(..) {
                self.process_completion(completion, Delivery::Store);
            }
        }

        let (tasks, orphans) = self.tasks.borrow_mut().take_all();
        let outstanding = self.outstanding.get();

        if outstanding > 0 {
            error!(
                outstanding,
                "kernel still owns requests after shutdown timeout, leaking their memory"
            );

            for task in &tasks {
                if let Some(request) = task.io().borrow_mut().take_in_flight() {
                    std::mem::forget(request);
                }
            }
            orphans.into_iter().for_each(std::mem::forget);

            if let Some(pool) = &self.pool {
                std::mem::forget(Rc::clone(pool));
            }
        } else {
            drop(orphans);
        }

        debug!(tasks = tasks.len(), "dropping remaining tasks");
        drop(tasks);

        {
            let ring = self.ring.borrow();
            if let Some(pool) = &self.pool {
                pool.borrow_mut().unregister(&ring);
            }
            shared::release_ring(&ring);
        }

        IS_CONTEXT_ACTIVE.with(|is_active| is_active.set(false));
        debug!("context shut down");
    }
}

// Test-only helpers
#[cfg(test)]
impl Scheduler {
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    pub(crate) fn num_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub(crate) fn num_orphans(&self) -> usize {
        self.tasks.borrow().num_orphans()
    }

    pub(crate) fn was_in_flight(&self, id: Id) -> bool {
        self.tasks.borrow().was_in_flight(id)
    }

    /// Pushes an entry no task knows about.
    pub(crate) fn push_raw(&self, entry: &io_uring::squeue::Entry) -> Result<(), crate::sqe::IoError> {
        self.ring.borrow_mut().push(entry)
    }

    pub(crate) fn inject_completion(&self, completion: Completion) {
        self.process_completion(completion, Delivery::Resume);
    }
}
