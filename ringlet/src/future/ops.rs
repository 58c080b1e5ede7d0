//! Request-bound futures for every supported operation.
//!
//! Each function builds a [`Request`] and wraps it in an [`Op`] (or a
//! [`Multishot`] stream). Nothing reaches the kernel until the future is
//! awaited inside a task.

use crate::context::PooledBuf;
use crate::future::{Multishot, Op};
use crate::sqe::{Completion, IoError, Request, Target};
use anyhow::anyhow;
use nix::fcntl::OFlag;
use nix::sys::socket::{AddressFamily, MsgFlags, SockFlag, SockProtocol, SockType};
use nix::sys::stat::Mode;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::Path;
use std::time::Duration;

fn unit(completion: Completion, _: Request) -> Result<(), IoError> {
    completion.into_result().map(|_| ())
}

fn fd(completion: Completion, _: Request) -> Result<RawFd, IoError> {
    completion.into_result().map(|n| n as RawFd)
}

fn len(completion: Completion, _: Request) -> Result<usize, IoError> {
    completion.into_result().map(|n| n as usize)
}

fn filled(completion: Completion, request: Request) -> Result<Vec<u8>, IoError> {
    let n = completion.into_result()?;
    request
        .into_buffer(n as usize)
        .ok_or_else(|| anyhow!("request carried no data buffer").into())
}

/// Awaits `request` and returns the raw signed result code of its completion:
/// `>= 0` on success, a negated errno on failure.
pub fn submit(request: Request) -> Op<i32> {
    Op::new(request, |completion, _| Ok(completion.result()))
}

pub fn nop() -> Op<()> {
    Op::new(Request::nop(), unit)
}

fn socket_args(
    domain: AddressFamily,
    ty: SockType,
    flags: SockFlag,
    protocol: Option<SockProtocol>,
) -> (i32, i32, i32) {
    (
        domain as i32,
        ty as i32 | flags.bits(),
        protocol.map_or(0, |p| p as i32),
    )
}

pub fn socket(
    domain: AddressFamily,
    ty: SockType,
    flags: SockFlag,
    protocol: Option<SockProtocol>,
) -> Op<RawFd> {
    let (domain, ty, protocol) = socket_args(domain, ty, flags, protocol);
    Op::new(Request::socket(domain, ty, protocol), fd)
}

/// Creates a socket installed in the direct descriptor table. The returned
/// value is the slot index, use it through [`Target::Fixed`].
pub fn socket_direct(
    domain: AddressFamily,
    ty: SockType,
    flags: SockFlag,
    protocol: Option<SockProtocol>,
) -> Op<u32> {
    let (domain, ty, protocol) = socket_args(domain, ty, flags, protocol);
    Op::new(Request::socket_direct(domain, ty, protocol), |c, _| {
        c.into_result()
    })
}

pub fn bind(fd: impl Into<Target>, addr: SocketAddr) -> Op<()> {
    Op::new(Request::bind(fd, addr), unit)
}

pub fn listen(fd: impl Into<Target>, backlog: i32) -> Op<()> {
    Op::new(Request::listen(fd, backlog), unit)
}

/// Accepts one connection, returning the new descriptor and the peer address
/// when the kernel reported one.
pub fn accept(fd: impl Into<Target>, flags: SockFlag) -> Op<(RawFd, Option<SocketAddr>)> {
    Op::new(Request::accept(fd, flags), |completion, request| {
        let fd = completion.into_result()? as RawFd;
        Ok((fd, request.peer_addr()))
    })
}

pub fn connect(fd: impl Into<Target>, addr: SocketAddr) -> Op<()> {
    Op::new(Request::connect(fd, addr), unit)
}

pub fn openat(dirfd: impl Into<Target>, path: impl AsRef<Path>, flags: OFlag, mode: Mode) -> Op<RawFd> {
    Op::try_new(Request::openat(dirfd, path, flags, mode), fd)
}

/// Reads into the spare capacity of `buf`, starting at `offset`. Returns the
/// buffer with its length extended by the number of bytes read.
pub fn read(fd: impl Into<Target>, buf: Vec<u8>, offset: u64) -> Op<Vec<u8>> {
    Op::new(Request::read(fd, buf, offset), filled)
}

pub fn write(fd: impl Into<Target>, buf: Vec<u8>, offset: u64) -> Op<usize> {
    Op::new(Request::write(fd, buf, offset), len)
}

pub fn send(fd: impl Into<Target>, buf: Vec<u8>, flags: MsgFlags) -> Op<usize> {
    Op::new(Request::send(fd, buf, flags), len)
}

pub fn recv(fd: impl Into<Target>, buf: Vec<u8>, flags: MsgFlags) -> Op<Vec<u8>> {
    Op::new(Request::recv(fd, buf, flags), filled)
}

pub fn close(fd: impl Into<Target>) -> Op<()> {
    Op::new(Request::close(fd), unit)
}

/// Sleeps for `duration`. Expiry is reported by the kernel as `-ETIME` and
/// maps to success. A zero duration is rejected, use
/// [`yield_now`](crate::task::yield_now) instead.
pub fn sleep(duration: Duration) -> Op<()> {
    Op::try_new(Request::timeout(duration), |completion, _| {
        match completion.result() {
            r if r == -libc::ETIME => Ok(()),
            _ => completion.into_result().map(|_| ()),
        }
    })
}

/// Accepts connections until the request is cancelled or fails.
pub fn accept_multi(fd: impl Into<Target>, flags: SockFlag) -> Multishot<RawFd> {
    Multishot::new(Request::accept_multi(fd, flags), |completion, _| {
        Some(completion.into_result().map(|n| n as RawFd))
    })
}

/// Receives into buffers picked by the kernel from the context's buffer
/// pool. The stream ends on end of file.
///
/// Fails with `ENOBUFS` once the pool is exhausted and at its maximum size.
/// Dropping the yielded buffers hands their slots back to the kernel.
pub fn recv_multi(fd: impl Into<Target>, flags: MsgFlags) -> Multishot<PooledBuf> {
    Multishot::new(Request::recv_multi(fd, flags), |completion, buffer| {
        match (completion.into_result(), buffer) {
            (Err(e), _) => Some(Err(e)),
            (Ok(0), _) => None,
            (Ok(_), Some(buf)) => Some(Ok(buf)),
            (Ok(n), None) => Some(Err(anyhow!("received {n} bytes without a buffer").into())),
        }
    })
}
