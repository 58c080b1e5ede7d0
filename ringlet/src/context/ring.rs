use crate::context::Completions;
use crate::runtime::RuntimeConfig;
use crate::sqe::{Completion, IoError};
use io_uring::squeue::Entry;
use io_uring::types::{CancelBuilder, SubmitArgs, Timespec};
use io_uring::{CompletionQueue, IoUring, SubmissionQueue, Submitter};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::warn;

/// `IORING_ENTER_GETEVENTS`
const ENTER_GETEVENTS: u32 = 1 << 0;

/// A wrapper around `io_uring` specifically configured for a Single Issuer.
///
/// This implementation leverages `IORING_SETUP_SINGLE_ISSUER` and `IORING_SETUP_DEFER_TASKRUN`.
/// This combination allows the kernel to defer processing completions until `io_uring_enter`
/// is explicitly called with GETEVENTS, minimizing interrupt overhead and context switches.
pub(crate) struct SingleIssuerRing {
    ring: IoUring,

    /// Built without the single issuer setup flags, the kernel rejected them.
    degraded: bool,
}

impl SingleIssuerRing {
    /// Builds the ring, optionally attached to the async work queue of the
    /// ring `attach_wq`.
    ///
    /// Kernels that reject a setup flag with `EINVAL` get a ring built with
    /// fewer flags and a warning. Any other failure is returned.
    pub(crate) fn try_new(cfg: &RuntimeConfig, attach_wq: Option<RawFd>) -> io::Result<Self> {
        let mut attempts = vec![(true, attach_wq)];
        if attach_wq.is_some() {
            attempts.push((true, None));
        }
        attempts.push((false, None));

        let mut last_err = None;
        for (idx, (perf, attach)) in attempts.into_iter().enumerate() {
            match Self::build(cfg, perf, attach) {
                Ok(ring) => {
                    if idx > 0 {
                        warn!(
                            single_issuer = perf,
                            attached = attach.is_some(),
                            "io_uring rejected setup flags, using a degraded ring"
                        );
                    }

                    if !ring.params().is_feature_nodrop() {
                        warn!(
                            "IORING_FEAT_NODROP is not supported by this kernel, completions \
                             are silently dropped when the completion queue overflows"
                        );
                    }

                    return Ok(SingleIssuerRing {
                        ring,
                        degraded: !perf,
                    });
                }
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| io::Error::from_raw_os_error(libc::EINVAL)))
    }

    fn build(cfg: &RuntimeConfig, perf: bool, attach_wq: Option<RawFd>) -> io::Result<IoUring> {
        let mut builder = IoUring::builder();
        builder.setup_cqsize((cfg.sq_ring_size * cfg.cq_ring_size_multiplier) as u32);

        if perf {
            builder
                // Keep submitting requests even if we encounter error. We want
                // a completion for every submission.
                .setup_submit_all()
                // Hint kernel that a single thread will submit requests
                .setup_single_issuer()
                // Only run `task_work` when we call `io_uring_enter` with GETEVENTS.
                .setup_defer_taskrun()
                // Handle completions ourselves prevent unwanted interrupts
                .setup_coop_taskrun()
                // Setup IORING_SQ_TASKRUN flag on SQ ring to indicate if completions
                // are pending w/o a syscall to `io_uring_enter`
                .setup_taskrun_flag();
        }

        if let Some(fd) = attach_wq {
            builder.setup_attach_wq(fd);
        }

        builder.build(cfg.sq_ring_size as u32)
    }

    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub(crate) fn submitter(&self) -> Submitter<'_> {
        self.ring.submitter()
    }

    pub(crate) fn sq(&mut self) -> SubmissionQueue<'_> {
        self.ring.submission()
    }

    pub(crate) fn cq(&mut self) -> CompletionQueue<'_> {
        self.ring.completion()
    }

    pub(crate) fn register_files_sparse(&self, count: u32) -> io::Result<()> {
        self.ring.submitter().register_files_sparse(count)
    }

    /// Pushes one entry, flushing the submission queue once if it is full.
    pub(crate) fn push(&mut self, entry: &Entry) -> Result<(), IoError> {
        // SAFETY: every pointer in `entry` references memory owned by a
        // request that is kept alive until its final completion.
        if unsafe { self.sq().push(entry) }.is_ok() {
            return Ok(());
        }

        self.ring.submit()?;
        unsafe { self.sq().push(entry).map_err(IoError::from) }
    }

    pub(crate) fn submit_and_wait(
        &mut self,
        num_to_wait: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        // Sync user space and kernel shared queue
        self.ring.submission().sync();

        if let Some(duration) = timeout {
            let ts = Timespec::from(duration);
            let args = SubmitArgs::new().timespec(&ts);

            return match self.ring.submitter().submit_with_args(num_to_wait, &args) {
                Ok(n) => Ok(n),

                // The wait is bounded so the loop can notice `stop` and the
                // shutdown deadline. Timeouts are not errors.
                Err(e) if e.raw_os_error() == Some(libc::ETIME) => Ok(0),

                Err(e) => Err(e),
            };
        }

        self.ring.submitter().submit_and_wait(num_to_wait)
    }

    /// Submits pending entries and runs deferred `task_work` without blocking,
    /// so completions that are already available become visible.
    pub(crate) fn submit_and_get_events(&mut self) -> io::Result<usize> {
        let to_submit = {
            let mut sq = self.sq();
            sq.sync();
            sq.len()
        };

        let res = unsafe {
            self.ring.submitter().enter::<libc::sigset_t>(
                to_submit as u32,
                0,
                ENTER_GETEVENTS,
                None,
            )
        };

        match res {
            Err(e) if matches!(e.raw_os_error(), Some(libc::EINTR | libc::EBUSY)) => Ok(0),
            other => other,
        }
    }

    /// Copies every ready completion into `out` and advances the completion
    /// queue head past them.
    pub(crate) fn reap_into(&mut self, out: &mut Completions) {
        let mut cq = self.cq();
        cq.sync();
        out.extend(cq.map(|cqe| Completion::from_cqe(&cqe)));
    }

    /// Cancels matching requests, blocking the calling thread until they are
    /// found and cancelled or `timeout` expires. Never goes through a task.
    pub(crate) fn sync_cancel(
        &self,
        builder: CancelBuilder,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        self.ring
            .submitter()
            .register_sync_cancel(timeout.map(Timespec::from), builder)
    }
}
