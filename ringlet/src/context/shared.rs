use crate::context::SingleIssuerRing;
use crate::runtime::{CpuAffinity, RuntimeConfig, RuntimeError};
use crate::utils::sys::{available_cpus, pin_current_thread};
use parking_lot::Mutex;
use std::os::fd::RawFd;
use tracing::{debug, error, warn};

/// The only state shared between contexts: the ring whose async work queue
/// new rings attach to, and the round-robin CPU counter. Locked only while a
/// context is being built or released.
struct SharedState {
    wq_fd: Option<RawFd>,
    next_cpu: usize,
}

static SHARED: Mutex<SharedState> = Mutex::new(SharedState {
    wq_fd: None,
    next_cpu: 0,
});

/// Builds the kernel queue for a new context, attaching it to the shared
/// work queue when configured, then applies the best-effort settings.
///
/// Failing to build the queue is fatal for the context. Failing to apply a
/// best-effort setting only logs a warning.
pub(crate) fn init_ring(cfg: &RuntimeConfig) -> Result<SingleIssuerRing, RuntimeError> {
    let (ring, cpu) = {
        let mut shared = SHARED.lock();

        let attach = cfg.share_kernel_workers.then_some(shared.wq_fd).flatten();
        let ring = SingleIssuerRing::try_new(cfg, attach).map_err(|e| {
            error!(fatal = true, error = %e, "failed to initialize the kernel queue");
            RuntimeError::KernelQueueInit(e)
        })?;

        if cfg.share_kernel_workers && shared.wq_fd.is_none() {
            shared.wq_fd = Some(ring.as_raw_fd());
        }

        let cpu = match cfg.cpu_affinity {
            CpuAffinity::None => None,
            CpuAffinity::RoundRobin => {
                let cpu = shared.next_cpu % available_cpus();
                shared.next_cpu = shared.next_cpu.wrapping_add(1);
                Some(cpu)
            }
            CpuAffinity::Core(cpu) => Some(cpu),
        };

        (ring, cpu)
    };

    if cfg.direct_fds > 0
        && let Err(e) = ring.register_files_sparse(cfg.direct_fds)
    {
        warn!(count = cfg.direct_fds, error = %e, "failed to register direct descriptor table");
    }

    if let Some(cpu) = cpu {
        match pin_current_thread(cpu) {
            Ok(()) => debug!(cpu, "pinned context thread"),
            Err(e) => warn!(cpu, error = %e, "failed to set cpu affinity"),
        }
    }

    Ok(ring)
}

/// Stops handing out `ring`'s descriptor as the shared work queue. Must run
/// before the ring is closed.
pub(crate) fn release_ring(ring: &SingleIssuerRing) {
    let mut shared = SHARED.lock();
    if shared.wq_fd == Some(ring.as_raw_fd()) {
        shared.wq_fd = None;
    }
}

#[cfg(test)]
pub(crate) fn shared_wq_fd() -> Option<RawFd> {
    SHARED.lock().wq_fd
}
