use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid;
use std::io;
use std::sync::OnceLock;

pub(crate) fn get_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Number of CPUs the process may run on, at least 1.
pub(crate) fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Pins the calling thread to `cpu`.
pub(crate) fn pin_current_thread(cpu: usize) -> nix::Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu)?;

    // Pid 0 targets the calling thread.
    sched_setaffinity(Pid::from_raw(0), &set)
}

/// Checks if the desired number of file descriptors is within the system's soft limit.
pub(crate) fn check_fd_ulimit(desired_fds: usize) -> io::Result<()> {
    let mut rlimit = std::mem::MaybeUninit::<libc::rlimit>::uninit();
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlimit.as_mut_ptr()) };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let rlimit = unsafe { rlimit.assume_init() };
    let current_limit = rlimit.rlim_cur as usize;

    if desired_fds > current_limit {
        Err(io::Error::other(format!(
            "Required direct descriptors ({desired_fds}) exceed the current ulimit ({current_limit}) \
             for open files. Raise it, e.g. '$ ulimit -n 65536', or lower `direct_fds`."
        )))
    } else {
        Ok(())
    }
}
