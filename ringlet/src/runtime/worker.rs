use crate::runtime::{Builder, Context};
use anyhow::{Context as _, Result, anyhow};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

fn next_worker_name() -> String {
    static WORKER_COUNT: AtomicUsize = AtomicUsize::new(0);
    format!("ringlet-{}", WORKER_COUNT.fetch_add(1, Ordering::Relaxed))
}

/// Starts an OS thread owning its own [`Context`] built from `builder`, and
/// runs `f` with it.
///
/// The thread is named after the builder's `thread_name`, or "ringlet-{id}"
/// where id is monotonically increasing. The context is shut down when `f`
/// returns.
pub fn spawn_worker<F, R>(builder: Builder, f: F) -> Result<JoinHandle<Result<R>>>
where
    F: FnOnce(&Context) -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    let name = builder.thread_name_or(next_worker_name);

    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let ctx = builder.thread_name(name).try_build()?;
            f(&ctx)
        })
        .context("failed to spawn worker thread")
}

/// Joins a worker, turning a panic into an error.
pub fn join_worker<R>(handle: JoinHandle<Result<R>>) -> Result<R> {
    handle
        .join()
        .map_err(|_| anyhow!("worker thread panicked"))?
}
