use crate::context::SingleIssuerRing;
use crate::runtime::{Builder, Context, RuntimeConfig, RuntimeError};
use crate::sqe::IoError;
use anyhow::Result;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

// Hosts without io_uring (seccomp, old kernels, sandboxes) refuse the setup
// syscall with one of these.
fn is_unavailable(errno: Option<i32>) -> bool {
    matches!(errno, Some(libc::ENOSYS) | Some(libc::EPERM))
}

pub(crate) fn ring_or_skip(cfg: &RuntimeConfig) -> Result<Option<SingleIssuerRing>> {
    match SingleIssuerRing::try_new(cfg, None) {
        Ok(ring) => Ok(Some(ring)),
        Err(e) if is_unavailable(e.raw_os_error()) => {
            eprintln!("skipping: io_uring unavailable ({e})");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn context_or_skip(builder: Builder) -> Result<Option<Context>> {
    let cfg = RuntimeConfig::try_from(builder)?;

    match Context::try_new(cfg) {
        Ok(ctx) => Ok(Some(ctx)),
        Err(RuntimeError::KernelQueueInit(e)) if is_unavailable(e.raw_os_error()) => {
            eprintln!("skipping: io_uring unavailable ({e})");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn small_context() -> Result<Option<Context>> {
    context_or_skip(
        Builder::new()
            .sq_ring_size(64)
            .direct_fds(16)
            .share_kernel_workers(false),
    )
}

/// True when the running kernel does not know the opcode or one of its flags.
pub(crate) fn unsupported_opcode(err: &IoError) -> bool {
    let unsupported = matches!(
        err.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::EOPNOTSUPP)
    );
    if unsupported {
        eprintln!("skipping: opcode unsupported by this kernel ({err})");
    }
    unsupported
}

#[must_use]
pub(crate) fn tempfile_with(data: &[u8]) -> File {
    let mut tmp = tempfile::tempfile().expect("failed to create tempfile");
    tmp.write_all(data).expect("failed to write tempfile");
    tmp.seek(SeekFrom::Start(0)).expect("failed to rewind tempfile");
    tmp
}

/// Suspends the current task on `id` once, the way a join handle does.
/// Lets tests build waits the public API cannot express, such as cycles.
pub(crate) struct WaitOn {
    id: crate::task::Id,
    waited: bool,
}

impl WaitOn {
    pub(crate) fn new(id: crate::task::Id) -> Self {
        Self { id, waited: false }
    }
}

impl Future for WaitOn {
    type Output = ();

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        if self.waited {
            return std::task::Poll::Ready(());
        }

        self.waited = true;
        if let Some(cur) = crate::task::current() {
            cur.io.borrow_mut().wait_on(self.id);
        }
        std::task::Poll::Pending
    }
}

/// Subscriber counting `WARN` events whose message contains a needle.
/// Install it with [`tracing::subscriber::with_default`].
#[derive(Clone)]
pub(crate) struct WarnCounter {
    needle: &'static str,
    hits: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl WarnCounter {
    pub(crate) fn new(needle: &'static str) -> Self {
        Self {
            needle,
            hits: Default::default(),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.hits.load(std::sync::atomic::Ordering::Relaxed)
    }
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl tracing::Subscriber for WarnCounter {
    fn enabled(&self, metadata: &tracing::Metadata<'_>) -> bool {
        *metadata.level() == tracing::Level::WARN
    }

    fn new_span(&self, _span: &tracing::span::Attributes<'_>) -> tracing::span::Id {
        tracing::span::Id::from_u64(1)
    }

    fn record(&self, _span: &tracing::span::Id, _values: &tracing::span::Record<'_>) {}

    fn record_follows_from(&self, _span: &tracing::span::Id, _follows: &tracing::span::Id) {}

    fn event(&self, event: &tracing::Event<'_>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);

        if visitor.0.contains(self.needle) {
            self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    fn enter(&self, _span: &tracing::span::Id) {}

    fn exit(&self, _span: &tracing::span::Id) {}
}
