use crate::context::{BufferPool, Scheduler};
use crate::future::CancelOutcome;
use crate::runtime::{Builder, RuntimeConfig, RuntimeError};
use crate::sqe::CancelTarget;
use crate::task::{Id, JoinHandle, Task};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// A single-threaded scheduler owning one kernel queue.
///
/// A `Context` lives on the thread that built it and is never `Send`. Run
/// one per thread for parallelism, see
/// [`spawn_worker`](crate::runtime::spawn_worker). At most one context can
/// be alive on a given thread.
///
/// Dropping the context shuts it down, see [`Context::shutdown`].
pub struct Context {
    scheduler: Rc<Scheduler>,
}

impl Context {
    /// Builds a context with the default configuration.
    pub fn new() -> anyhow::Result<Context> {
        Builder::new().try_build()
    }

    pub(crate) fn try_new(cfg: RuntimeConfig) -> Result<Context, RuntimeError> {
        Ok(Context {
            scheduler: Scheduler::try_new(cfg)?,
        })
    }

    /// A cheap, clonable handle tasks can capture to spawn, abort or stop.
    pub fn handle(&self) -> Handle {
        Handle::new(Rc::downgrade(&self.scheduler))
    }

    /// Enqueues a task. Nothing runs until the loop is driven by
    /// [`Context::run`] or [`Context::block_on`].
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.scheduler.spawn(future)
    }

    /// Spawns `future` and drives the loop until it finishes.
    ///
    /// Other tasks make progress meanwhile and are left where they are when
    /// this returns. Fails with [`RuntimeError::Deadlock`] if nothing can
    /// run and nothing is outstanding, and with [`RuntimeError::Stopped`]
    /// after [`Handle::stop`].
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, RuntimeError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.scheduler.block_on(future)
    }

    /// Drives the loop until [`Handle::stop`] is called or a fatal error
    /// occurs.
    pub fn run(&self) -> Result<(), RuntimeError> {
        self.scheduler.run()
    }

    /// Breaks the loop after the current pass.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// See [`Handle::abort`].
    pub fn abort(&self, id: Id) -> bool {
        self.scheduler.abort(id)
    }

    /// Cancels matching requests without going through a task, blocking the
    /// calling thread for at most `timeout`.
    ///
    /// The cancelled requests still complete with `-ECANCELED`, delivered to
    /// their tasks the next time the loop is driven.
    pub fn cancel_sync(&self, target: CancelTarget, match_all: bool, timeout: Duration) -> CancelOutcome {
        self.scheduler.cancel_sync(target, match_all, timeout)
    }

    /// Runs `f` against the buffer pool, if one is registered.
    pub fn with_buffer_pool<R>(&self, f: impl FnOnce(&mut BufferPool) -> R) -> Option<R> {
        self.scheduler.with_buffer_pool(f)
    }

    /// Stops the loop, cancels every outstanding request and waits, up to
    /// the configured shutdown timeout, for the kernel to release them.
    /// Remaining tasks are dropped and their join handles observe
    /// [`JoinError::Cancelled`](crate::task::JoinError::Cancelled).
    pub fn shutdown(self) {
        // Drop does the work.
    }

    #[cfg(test)]
    pub(crate) fn scheduler(&self) -> &Rc<Scheduler> {
        &self.scheduler
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

/// Non-owning reference to a [`Context`].
///
/// Every operation is a no-op once the context is gone: spawned tasks are
/// dropped immediately and their join handles observe
/// [`JoinError::Cancelled`](crate::task::JoinError::Cancelled).
#[derive(Clone)]
pub struct Handle {
    scheduler: Weak<Scheduler>,
}

impl Handle {
    pub(crate) fn new(scheduler: Weak<Scheduler>) -> Self {
        Self { scheduler }
    }

    /// A handle that never had a context.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new(Weak::new())
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.spawn(future),
            None => Task::new(future, self.clone()).1,
        }
    }

    /// Moves task `id` to `Cancelled`, cancelling its outstanding request in
    /// the kernel. Returns `false` if no live task has this id.
    pub fn abort(&self, id: Id) -> bool {
        self.scheduler
            .upgrade()
            .is_some_and(|scheduler| scheduler.abort(id))
    }

    pub fn stop(&self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.stop();
        }
    }

    /// See [`Context::cancel_sync`].
    pub fn cancel_sync(&self, target: CancelTarget, match_all: bool, timeout: Duration) -> CancelOutcome {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.cancel_sync(target, match_all, timeout),
            None => CancelOutcome::NotFound,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.scheduler.strong_count() > 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_not_impl_any;

    assert_not_impl_any!(Context: Send, Sync);
    assert_not_impl_any!(Handle: Send, Sync);

    #[test]
    fn test_detached_handle() {
        let handle = Handle::detached();
        assert!(!handle.is_alive());

        let mut join = handle.spawn(async { 1 });
        assert!(join.is_finished());
        assert!(join.try_take().unwrap().unwrap_err().is_cancelled());
        assert!(!handle.abort(join.id()));
        assert_eq!(
            handle.cancel_sync(CancelTarget::Any, false, Duration::from_millis(1)),
            CancelOutcome::NotFound
        );
    }
}
