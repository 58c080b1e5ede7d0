use crate::context::{BufferPoolConfig, MAX_RING_ENTRIES};
use crate::runtime::Context;
use crate::utils::sys::check_fd_ulimit;
use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::time::Duration;

/// Default size for io_uring SQ ring.
const SQ_RING_SIZE: usize = 1024;

/// Final cq ring size is SQ_RING_SIZE * multipler
const CQ_RING_SIZE_MULTIPLIER: usize = 2;

/// Number of direct file descriptors per ring
const DIRECT_FDS: u32 = 1024;

/// Upper bound of one blocking wait on the kernel queue.
const WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// How long shutdown waits for cancelled requests to drain.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// CPU pinning applied to the thread building a context.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAffinity {
    /// Leave the thread where the OS puts it.
    #[default]
    None,
    /// Each new context takes the next CPU, wrapping around.
    RoundRobin,
    /// Pin to this CPU.
    Core(usize),
}

/// Configures and builds a [`Context`].
///
/// ```ignore
/// let ctx = Builder::new()
///     .sq_ring_size(256)
///     .thread_name("ringlet-io")
///     .try_build()?;
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    sq_ring_size: usize,
    cq_ring_size_multiplier: usize,
    direct_fds: u32,
    wait_timeout: Duration,
    shutdown_timeout: Duration,
    share_kernel_workers: bool,
    cpu_affinity: CpuAffinity,
    thread_name: Option<String>,
    buffer_pool: BufferPoolConfig,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            sq_ring_size: SQ_RING_SIZE,
            cq_ring_size_multiplier: CQ_RING_SIZE_MULTIPLIER,
            direct_fds: DIRECT_FDS,
            wait_timeout: WAIT_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            share_kernel_workers: true,
            cpu_affinity: CpuAffinity::default(),
            thread_name: None,
            buffer_pool: BufferPoolConfig::default(),
        }
    }

    #[track_caller]
    pub fn sq_ring_size(mut self, val: usize) -> Self {
        assert!(val.is_power_of_two(), "sq_ring_size must be a power of two");
        self.sq_ring_size = val;
        self
    }

    #[track_caller]
    pub fn cq_ring_size_multiplier(mut self, val: usize) -> Self {
        assert!(val > 0, "cq_ring_size_multiplier must be greater than 0");
        self.cq_ring_size_multiplier = val;
        self
    }

    /// Size of the sparse direct descriptor table. `0` skips registration.
    pub fn direct_fds(mut self, val: u32) -> Self {
        self.direct_fds = val;
        self
    }

    #[track_caller]
    pub fn wait_timeout(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "wait_timeout must be greater than 0");
        self.wait_timeout = val;
        self
    }

    pub fn shutdown_timeout(mut self, val: Duration) -> Self {
        self.shutdown_timeout = val;
        self
    }

    /// Attach to the async work queue of the first live context, so the
    /// kernel's background workers are shared across threads.
    pub fn share_kernel_workers(mut self, val: bool) -> Self {
        self.share_kernel_workers = val;
        self
    }

    pub fn cpu_affinity(mut self, val: CpuAffinity) -> Self {
        self.cpu_affinity = val;
        self
    }

    /// Names the thread building the context.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        self.thread_name = Some(val.into());
        self
    }

    #[track_caller]
    pub fn buf_size(mut self, val: usize) -> Self {
        assert!(val > 0, "buf_size must be greater than 0");
        self.buffer_pool.buf_size = val;
        self
    }

    pub fn initial_entries(mut self, val: u16) -> Self {
        self.buffer_pool.initial_entries = val;
        self
    }

    /// Maximum number of buffer pool slots. `0` disables the pool.
    #[track_caller]
    pub fn max_entries(mut self, val: u16) -> Self {
        assert!(
            val <= MAX_RING_ENTRIES,
            "max_entries must be at most {MAX_RING_ENTRIES}"
        );
        self.buffer_pool.max_entries = val;
        self
    }

    pub fn bgid(mut self, val: u16) -> Self {
        self.buffer_pool.bgid = val;
        self
    }

    pub(crate) fn thread_name_or(&self, default: impl FnOnce() -> String) -> String {
        self.thread_name.clone().unwrap_or_else(default)
    }

    /// Creates the configured `Context` on the calling thread.
    pub fn try_build(self) -> Result<Context> {
        let cfg = self.try_into()?;
        Ok(Context::try_new(cfg)?)
    }
}

// Immutable view of the builder consumed by the context.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) sq_ring_size: usize,
    pub(crate) cq_ring_size_multiplier: usize,
    pub(crate) direct_fds: u32,
    pub(crate) wait_timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) share_kernel_workers: bool,
    pub(crate) cpu_affinity: CpuAffinity,
    pub(crate) thread_name: Option<String>,
    pub(crate) buffer_pool: BufferPoolConfig,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        let pool = &self.buffer_pool;
        if pool.initial_entries > pool.max_entries {
            return Err(anyhow!(
                "initial_entries ({}) exceeds max_entries ({})",
                pool.initial_entries,
                pool.max_entries
            ));
        }

        if u32::try_from(pool.buf_size).is_err() {
            return Err(anyhow!("buf_size ({}) does not fit in u32", pool.buf_size));
        }

        check_fd_ulimit(self.direct_fds as usize)?;

        Ok(())
    }

    pub(crate) fn buffer_pool_enabled(&self) -> bool {
        self.buffer_pool.max_entries > 0
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = RuntimeConfig {
            sq_ring_size: builder.sq_ring_size,
            cq_ring_size_multiplier: builder.cq_ring_size_multiplier,
            direct_fds: builder.direct_fds,
            wait_timeout: builder.wait_timeout,
            shutdown_timeout: builder.shutdown_timeout,
            share_kernel_workers: builder.share_kernel_workers,
            cpu_affinity: builder.cpu_affinity,
            thread_name: builder.thread_name,
            buffer_pool: builder.buffer_pool,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}
