use crate::sqe::OpcodeError;
use crate::sqe::parse::{PeerAddr, SockAddrRepr, socket_addr_to_c};
use crate::task::Id;
use bitflags::bitflags;
use io_uring::opcode;
use io_uring::squeue::{self, Entry};
use io_uring::types::{self, CancelBuilder, DestinationSlot, Timespec};
use nix::fcntl::OFlag;
use nix::sys::socket::{MsgFlags, SockFlag};
use nix::sys::stat::Mode;
use std::ffi::CString;
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

/// Resource a request operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    None,
    /// Regular OS file descriptor.
    Fd(RawFd),
    /// Index into the ring's direct descriptor table.
    Fixed(u32),
}

impl From<RawFd> for Target {
    fn from(fd: RawFd) -> Self {
        Target::Fd(fd)
    }
}

// Dispatches on the target kind so the same opcode builder is used for
// regular and direct descriptors.
macro_rules! resolve_fd {
    ($target:expr, |$fd:ident| $body:expr) => {
        match $target {
            Target::Fd(raw) => {
                let $fd = types::Fd(raw);
                $body
            }
            Target::Fixed(idx) => {
                let $fd = types::Fixed(idx);
                $body
            }
            Target::None => return Err(OpcodeError::UnsupportedTarget(Target::None)),
        }
    };
}

bitflags! {
    /// Side flags unioned into a request, see [`Marker`](crate::sqe::Marker).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestFlags: u8 {
        /// Always punt the request to the kernel's async workers.
        const ASYNC = 1 << 0;
        /// Start only once every previously submitted request completed.
        const DRAIN = 1 << 1;
        /// The target is a direct descriptor index.
        const FIXED_FILE = 1 << 2;
    }
}

impl RequestFlags {
    fn to_sqe_flags(self) -> squeue::Flags {
        let mut flags = squeue::Flags::empty();
        if self.contains(Self::ASYNC) {
            flags |= squeue::Flags::ASYNC;
        }
        if self.contains(Self::DRAIN) {
            flags |= squeue::Flags::IO_DRAIN;
        }
        // FIXED_FILE is set by the opcode builder for `types::Fixed` targets.
        flags
    }
}

/// What a cancellation request matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    /// The request currently in flight for this task (its correlation id).
    Task(Id),
    /// Every request operating on a descriptor.
    Fd(Target),
    /// Any request on the ring.
    Any,
}

impl CancelTarget {
    pub(crate) fn to_builder(self, match_all: bool) -> Result<CancelBuilder, OpcodeError> {
        let builder = match self {
            CancelTarget::Task(id) => CancelBuilder::user_data(id.as_u64()),
            CancelTarget::Fd(Target::Fd(fd)) => CancelBuilder::fd(types::Fd(fd)),
            CancelTarget::Fd(Target::Fixed(idx)) => CancelBuilder::fd(types::Fixed(idx)),
            CancelTarget::Fd(Target::None) => {
                return Err(OpcodeError::UnsupportedTarget(Target::None));
            }
            CancelTarget::Any => CancelBuilder::any(),
        };

        Ok(if match_all { builder.all() } else { builder })
    }
}

pub(crate) enum Kind {
    Nop,
    Socket {
        domain: i32,
        socket_type: i32,
        protocol: i32,
        direct: bool,
    },
    Bind {
        addr: Box<SockAddrRepr>,
        len: libc::socklen_t,
    },
    Listen {
        backlog: i32,
    },
    Accept {
        peer: Box<PeerAddr>,
        flags: SockFlag,
    },
    AcceptMulti {
        flags: SockFlag,
    },
    Connect {
        addr: Box<SockAddrRepr>,
        len: libc::socklen_t,
    },
    OpenAt {
        path: CString,
        flags: OFlag,
        mode: Mode,
    },
    Read {
        buf: Vec<u8>,
        offset: u64,
    },
    Write {
        buf: Vec<u8>,
        offset: u64,
    },
    Send {
        buf: Vec<u8>,
        flags: MsgFlags,
    },
    Recv {
        buf: Vec<u8>,
        flags: MsgFlags,
    },
    RecvMulti {
        flags: MsgFlags,
        bgid: Option<u16>,
    },
    Close,
    Timeout {
        ts: Box<Timespec>,
    },
    Cancel {
        target: CancelTarget,
        match_all: bool,
    },
}

impl Kind {
    fn name(&self) -> &'static str {
        match self {
            Kind::Nop => "nop",
            Kind::Socket { .. } => "socket",
            Kind::Bind { .. } => "bind",
            Kind::Listen { .. } => "listen",
            Kind::Accept { .. } => "accept",
            Kind::AcceptMulti { .. } => "accept_multi",
            Kind::Connect { .. } => "connect",
            Kind::OpenAt { .. } => "openat",
            Kind::Read { .. } => "read",
            Kind::Write { .. } => "write",
            Kind::Send { .. } => "send",
            Kind::Recv { .. } => "recv",
            Kind::RecvMulti { .. } => "recv_multi",
            Kind::Close => "close",
            Kind::Timeout { .. } => "timeout",
            Kind::Cancel { .. } => "cancel",
        }
    }
}

/// One operation destined for the kernel queue.
///
/// A request owns every resource the kernel dereferences (buffers, socket
/// addresses, paths, timespecs). Once submitted it is parked inside its task
/// until the final completion arrives, so the memory stays valid even if the
/// awaiting future is dropped. The correlation id is assigned by the
/// scheduler at submission time, never by the caller.
pub struct Request {
    target: Target,
    kind: Kind,
    flags: RequestFlags,
    priority: u16,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.kind.name())
            .field("target", &self.target)
            .field("flags", &self.flags)
            .field("priority", &self.priority)
            .finish()
    }
}

// Constructors.
impl Request {
    fn new(target: Target, kind: Kind) -> Self {
        Self {
            target,
            kind,
            flags: RequestFlags::empty(),
            priority: 0,
        }
    }

    pub fn nop() -> Self {
        Self::new(Target::None, Kind::Nop)
    }

    pub fn socket(domain: i32, socket_type: i32, protocol: i32) -> Self {
        Self::new(
            Target::None,
            Kind::Socket {
                domain,
                socket_type,
                protocol,
                direct: false,
            },
        )
    }

    /// Like [`Request::socket`] but the kernel installs the socket in a free
    /// slot of the direct descriptor table and returns the slot index.
    pub fn socket_direct(domain: i32, socket_type: i32, protocol: i32) -> Self {
        Self::new(
            Target::None,
            Kind::Socket {
                domain,
                socket_type,
                protocol,
                direct: true,
            },
        )
    }

    pub fn bind(fd: impl Into<Target>, addr: SocketAddr) -> Self {
        let (addr, len) = socket_addr_to_c(&addr);
        Self::new(
            fd.into(),
            Kind::Bind {
                addr: Box::new(addr),
                len,
            },
        )
    }

    pub fn listen(fd: impl Into<Target>, backlog: i32) -> Self {
        Self::new(fd.into(), Kind::Listen { backlog })
    }

    pub fn accept(fd: impl Into<Target>, flags: SockFlag) -> Self {
        Self::new(
            fd.into(),
            Kind::Accept {
                peer: Box::new(PeerAddr::new()),
                flags,
            },
        )
    }

    pub fn accept_multi(fd: impl Into<Target>, flags: SockFlag) -> Self {
        Self::new(fd.into(), Kind::AcceptMulti { flags })
    }

    pub fn connect(fd: impl Into<Target>, addr: SocketAddr) -> Self {
        let (addr, len) = socket_addr_to_c(&addr);
        Self::new(
            fd.into(),
            Kind::Connect {
                addr: Box::new(addr),
                len,
            },
        )
    }

    /// Opens `path` relative to `dirfd`, or to the current directory when the
    /// target is [`Target::None`].
    pub fn openat(
        dirfd: impl Into<Target>,
        path: impl AsRef<Path>,
        flags: OFlag,
        mode: Mode,
    ) -> Result<Self, OpcodeError> {
        let path = CString::new(path.as_ref().as_os_str().as_bytes())?;
        Ok(Self::new(dirfd.into(), Kind::OpenAt { path, flags, mode }))
    }

    /// Reads into the spare capacity of `buf`.
    pub fn read(fd: impl Into<Target>, buf: Vec<u8>, offset: u64) -> Self {
        Self::new(fd.into(), Kind::Read { buf, offset })
    }

    pub fn write(fd: impl Into<Target>, buf: Vec<u8>, offset: u64) -> Self {
        Self::new(fd.into(), Kind::Write { buf, offset })
    }

    pub fn send(fd: impl Into<Target>, buf: Vec<u8>, flags: MsgFlags) -> Self {
        Self::new(fd.into(), Kind::Send { buf, flags })
    }

    /// Receives into the spare capacity of `buf`.
    pub fn recv(fd: impl Into<Target>, buf: Vec<u8>, flags: MsgFlags) -> Self {
        Self::new(fd.into(), Kind::Recv { buf, flags })
    }

    /// Multishot receive. Buffers are picked by the kernel from the
    /// context's buffer pool.
    pub fn recv_multi(fd: impl Into<Target>, flags: MsgFlags) -> Self {
        Self::new(fd.into(), Kind::RecvMulti { flags, bgid: None })
    }

    pub fn close(fd: impl Into<Target>) -> Self {
        Self::new(fd.into(), Kind::Close)
    }

    /// Relative timeout. Expiry completes with `-ETIME`.
    pub fn timeout(duration: Duration) -> Result<Self, OpcodeError> {
        if duration.is_zero() {
            return Err(OpcodeError::SleepZeroDuration);
        }

        Ok(Self::new(
            Target::None,
            Kind::Timeout {
                ts: Box::new(Timespec::from(duration)),
            },
        ))
    }

    pub fn cancel(target: CancelTarget, match_all: bool) -> Self {
        Self::new(Target::None, Kind::Cancel { target, match_all })
    }
}

// Accessors and combinators.
impl Request {
    pub fn target(&self) -> Target {
        self.target
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// I/O priority, honored by read and write requests.
    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub(crate) fn set_target(&mut self, target: Target) {
        self.target = target;
    }

    pub(crate) fn set_priority(&mut self, priority: u16) {
        self.priority = priority;
    }

    pub(crate) fn insert_flags(&mut self, flags: RequestFlags) {
        self.flags |= flags;
    }

    /// Checks the arguments that cannot be encoded, before the request is
    /// handed to a task.
    pub(crate) fn validate(&self) -> Result<(), OpcodeError> {
        let needs_fd = !matches!(
            self.kind,
            Kind::Nop
                | Kind::Socket { .. }
                | Kind::OpenAt { .. }
                | Kind::Timeout { .. }
                | Kind::Cancel { .. }
        );

        if needs_fd && self.target == Target::None {
            return Err(OpcodeError::UnsupportedTarget(self.target));
        }

        if let (Kind::OpenAt { .. }, Target::Fixed(_)) = (&self.kind, self.target) {
            return Err(OpcodeError::UnsupportedTarget(self.target));
        }

        let len = match &self.kind {
            Kind::Read { buf, .. } | Kind::Recv { buf, .. } => buf.capacity() - buf.len(),
            Kind::Write { buf, .. } | Kind::Send { buf, .. } => buf.len(),
            _ => 0,
        };

        to_len(len).map(|_| ())
    }

    pub(crate) fn is_multishot(&self) -> bool {
        matches!(self.kind, Kind::AcceptMulti { .. } | Kind::RecvMulti { .. })
    }

    pub(crate) fn needs_buffer_group(&self) -> bool {
        matches!(self.kind, Kind::RecvMulti { bgid: None, .. })
    }

    pub(crate) fn set_buffer_group(&mut self, group: u16) {
        if let Kind::RecvMulti { bgid, .. } = &mut self.kind {
            *bgid = Some(group);
        }
    }

    /// Encodes the request into a submission entry tagged with `user_data`.
    ///
    /// Pointers in the entry reference heap memory owned by `self`, moving
    /// the request afterwards does not invalidate them.
    pub(crate) fn to_entry(&mut self, user_data: u64) -> Result<Entry, OpcodeError> {
        let target = self.target;
        let priority = self.priority;

        let entry = match &mut self.kind {
            Kind::Nop => opcode::Nop::new().build(),
            Kind::Socket {
                domain,
                socket_type,
                protocol,
                direct,
            } => opcode::Socket::new(*domain, *socket_type, *protocol)
                .file_index((*direct).then(DestinationSlot::auto_target))
                .build(),
            Kind::Bind { addr, len } => {
                resolve_fd!(target, |fd| opcode::Bind::new(fd, addr.as_ptr(), *len).build())
            }
            Kind::Listen { backlog } => {
                resolve_fd!(target, |fd| opcode::Listen::new(fd, *backlog).build())
            }
            Kind::Accept { peer, flags } => {
                let addr = std::ptr::from_mut(&mut peer.storage).cast::<libc::sockaddr>();
                let len = std::ptr::from_mut(&mut peer.len);
                resolve_fd!(target, |fd| opcode::Accept::new(fd, addr, len)
                    .flags(flags.bits())
                    .build())
            }
            Kind::AcceptMulti { flags } => {
                resolve_fd!(target, |fd| opcode::AcceptMulti::new(fd)
                    .flags(flags.bits())
                    .build())
            }
            Kind::Connect { addr, len } => {
                resolve_fd!(target, |fd| opcode::Connect::new(fd, addr.as_ptr(), *len).build())
            }
            Kind::OpenAt { path, flags, mode } => {
                let dirfd = match target {
                    Target::None => types::Fd(libc::AT_FDCWD),
                    Target::Fd(fd) => types::Fd(fd),
                    Target::Fixed(_) => return Err(OpcodeError::UnsupportedTarget(target)),
                };

                opcode::OpenAt::new(dirfd, path.as_ptr())
                    .flags(flags.bits())
                    .mode(mode.bits())
                    .build()
            }
            Kind::Read { buf, offset } => {
                let len = to_len(buf.capacity() - buf.len())?;
                let ptr = unsafe { buf.as_mut_ptr().add(buf.len()) };
                resolve_fd!(target, |fd| opcode::Read::new(fd, ptr, len)
                    .offset(*offset)
                    .ioprio(priority)
                    .build())
            }
            Kind::Write { buf, offset } => {
                let len = to_len(buf.len())?;
                resolve_fd!(target, |fd| opcode::Write::new(fd, buf.as_ptr(), len)
                    .offset(*offset)
                    .ioprio(priority)
                    .build())
            }
            Kind::Send { buf, flags } => {
                let len = to_len(buf.len())?;
                resolve_fd!(target, |fd| opcode::Send::new(fd, buf.as_ptr(), len)
                    .flags(flags.bits())
                    .build())
            }
            Kind::Recv { buf, flags } => {
                let len = to_len(buf.capacity() - buf.len())?;
                let ptr = unsafe { buf.as_mut_ptr().add(buf.len()) };
                resolve_fd!(target, |fd| opcode::Recv::new(fd, ptr, len)
                    .flags(flags.bits())
                    .build())
            }
            Kind::RecvMulti { flags, bgid } => {
                let Some(bgid) = *bgid else {
                    return Err(OpcodeError::MissingBufferGroup);
                };
                resolve_fd!(target, |fd| opcode::RecvMulti::new(fd, bgid)
                    .flags(flags.bits())
                    .build())
            }
            Kind::Close => resolve_fd!(target, |fd| opcode::Close::new(fd).build()),
            Kind::Timeout { ts } => opcode::Timeout::new(std::ptr::from_ref(&**ts)).build(),
            Kind::Cancel { target, match_all } => {
                opcode::AsyncCancel2::new(target.to_builder(*match_all)?).build()
            }
        };

        Ok(entry
            .flags(self.flags.to_sqe_flags())
            .user_data(user_data))
    }
}

// Output helpers, used once the final completion handed the request back.
impl Request {
    /// Returns the data buffer, with its length extended by `filled` bytes
    /// for reads and receives.
    pub(crate) fn into_buffer(self, filled: usize) -> Option<Vec<u8>> {
        match self.kind {
            Kind::Read { mut buf, .. } | Kind::Recv { mut buf, .. } => {
                let new_len = std::cmp::min(buf.len() + filled, buf.capacity());
                // SAFETY: the kernel initialized `filled` bytes of spare capacity.
                unsafe { buf.set_len(new_len) };
                Some(buf)
            }
            Kind::Write { buf, .. } | Kind::Send { buf, .. } => Some(buf),
            _ => None,
        }
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            Kind::Accept { peer, .. } => peer.to_socket_addr(),
            _ => None,
        }
    }
}

fn to_len(len: usize) -> Result<u32, OpcodeError> {
    u32::try_from(len).map_err(|_| OpcodeError::BufferTooLarge(len))
}
