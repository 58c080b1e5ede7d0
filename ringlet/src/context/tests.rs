use crate::buffer::PooledBuf;
use crate::cancel::{self, CancelOutcome, CancelTarget};
use crate::ops;
use crate::runtime::{Builder, Context, RuntimeConfig, RuntimeError, join_worker, spawn_worker};
use crate::sqe::{Completion, CompletionFlags, IoError, Marker, Target};
use crate::task::{self, JoinError, yield_now};
use crate::test_utils::*;
use anyhow::Result;
use either::Either;
use futures::StreamExt;
use nix::fcntl::OFlag;
use nix::sys::socket::{AddressFamily, MsgFlags, SockFlag, SockType, setsockopt, sockopt};
use nix::sys::stat::Mode;
use std::io::Write;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};

fn boom(message: &'static str) -> u8 {
    panic!("{message}")
}

// Opens a listener through the ring. Kernels without the socket, bind or
// listen opcodes fall back to a std listener.
async fn open_listener(addr: SocketAddr) -> Result<Either<RawFd, TcpListener>> {
    let fd = match ops::socket(AddressFamily::Inet, SockType::Stream, SockFlag::SOCK_CLOEXEC, None).await {
        Ok(fd) => fd,
        Err(e) if unsupported_opcode(&e) => return Ok(Either::Right(TcpListener::bind(addr)?)),
        Err(e) => return Err(e.into()),
    };

    // SAFETY: `fd` was just returned by the kernel and is still open.
    setsockopt(&unsafe { BorrowedFd::borrow_raw(fd) }, sockopt::ReuseAddr, &true)?;

    let bound = match ops::bind(fd, addr).await {
        Ok(()) => ops::listen(fd, 16).await,
        Err(e) => Err(e),
    };

    match bound {
        Ok(()) => Ok(Either::Left(fd)),
        Err(e) if unsupported_opcode(&e) => {
            ops::close(fd).await?;
            Ok(Either::Right(TcpListener::bind(addr)?))
        }
        Err(e) => Err(e.into()),
    }
}

#[test]
fn test_cancel_accept_by_descriptor() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };
    let handle = ctx.handle();

    ctx.block_on(async move {
        let listener = open_listener("127.0.0.1:12345".parse()?).await?;
        let fd = listener.as_ref().either(|fd| *fd, |l| l.as_raw_fd());

        let accept = handle.spawn(async move { ops::accept(fd, SockFlag::SOCK_CLOEXEC).await });
        let canceller = handle.spawn(async move { cancel::cancel_fd(fd, false).await });

        let cancelled = canceller.await??;
        if cancelled == CancelOutcome::Failed(libc::EINVAL) {
            eprintln!("skipping: cancel by descriptor unsupported by this kernel");
            accept.abort();
        } else {
            assert!(matches!(cancelled, CancelOutcome::Cancelled(_)));

            let res = accept.await?;
            assert!(res.as_ref().is_err_and(IoError::is_cancelled), "{res:?}");
        }

        if let Either::Left(fd) = listener {
            ops::close(fd).await?;
        }
        Ok::<_, anyhow::Error>(())
    })??;

    Ok(())
}

#[test]
fn test_cancel_any_wakes_every_sleeper() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };
    let handle = ctx.handle();
    let start = Instant::now();

    ctx.block_on(async move {
        let sleepers = [
            handle.spawn(ops::sleep(Duration::from_secs(2))),
            handle.spawn(ops::sleep(Duration::from_secs(2))),
        ];
        let canceller = handle.spawn(cancel::cancel_any(true));

        let cancelled = canceller.await??;
        if cancelled == CancelOutcome::Failed(libc::EINVAL) {
            eprintln!("skipping: cancel any unsupported by this kernel");
            sleepers.iter().for_each(|s| {
                s.abort();
            });
            return Ok(());
        }
        assert!(matches!(cancelled, CancelOutcome::Cancelled(n) if n >= 1), "{cancelled:?}");

        for sleeper in sleepers {
            let res = sleeper.await?;
            assert!(res.as_ref().is_err_and(IoError::is_cancelled), "{res:?}");
        }
        Ok::<_, anyhow::Error>(())
    })??;

    assert!(start.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[test]
fn test_close_valid_descriptor() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };

    let fd = tempfile_with(b"ringlet").into_raw_fd();
    let closer = ctx.spawn(async move { ops::submit(crate::sqe::Request::close(fd)).await });
    let id = closer.id();

    let res = ctx.block_on(closer)???;
    assert_eq!(res, 0);

    let scheduler = ctx.scheduler();
    assert!(scheduler.was_in_flight(id));
    assert_eq!(scheduler.num_tasks(), 0);
    assert_eq!(scheduler.outstanding(), 0);
    Ok(())
}

#[test]
fn test_independent_contexts_resume_on_spawning_thread() -> Result<()> {
    // Probe once so hosts without io_uring skip instead of failing.
    if small_context()?.is_none() {
        return Ok(());
    }

    let workers = (0..4)
        .map(|_| {
            spawn_worker(Builder::new().sq_ring_size(16), |ctx| {
                let spawner = thread::current().id();
                let seen = ctx.block_on(async {
                    let before = thread::current().id();
                    ops::nop().await?;
                    Ok::<_, IoError>((before, thread::current().id()))
                })??;

                Ok((spawner, seen))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut threads = Vec::new();
    for worker in workers {
        let (spawner, (before, after)) = join_worker(worker)?;
        assert_eq!(spawner, before);
        assert_eq!(spawner, after);
        threads.push(spawner);
    }

    threads.dedup();
    assert_eq!(threads.len(), 4);
    Ok(())
}

#[test]
fn test_task_without_io_never_in_flight() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };

    let plain = ctx.spawn(async { 42 });
    let yielding = ctx.spawn(async {
        yield_now().await;
        yield_now().await;
        7
    });
    let ids = [plain.id(), yielding.id()];

    assert_eq!(ctx.block_on(plain)??, 42);
    assert_eq!(ctx.block_on(yielding)??, 7);

    for id in ids {
        assert!(!ctx.scheduler().was_in_flight(id));
    }
    Ok(())
}

#[test]
fn test_unknown_completion_is_ignored() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };
    let scheduler = ctx.scheduler();

    // An id no task ever had, and a real kernel completion nobody claims.
    scheduler.inject_completion(Completion::new(0xdead_beef, 0, CompletionFlags::empty()));
    scheduler.push_raw(
        &io_uring::opcode::Nop::new()
            .build()
            .user_data(0xfeed_face),
    )?;

    let res = ctx.block_on(async {
        ops::nop().await?;
        ops::nop().await
    })?;
    assert!(res.is_ok());

    assert_eq!(scheduler.num_tasks(), 0);
    assert_eq!(scheduler.outstanding(), 0);
    Ok(())
}

#[test]
fn test_double_cancel_reports_once() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };
    let handle = ctx.handle();

    ctx.block_on(async move {
        let sleeper = handle.spawn(ops::sleep(Duration::from_secs(10)));

        // Let the sleeper submit first.
        yield_now().await;

        let first = cancel::cancel(sleeper.id(), false).await?;
        let second = cancel::cancel(sleeper.id(), false).await?;

        assert!(first.is_success(), "{first:?}");
        assert!(
            matches!(
                second,
                CancelOutcome::NotFound | CancelOutcome::AlreadyCompleting
            ),
            "{second:?}"
        );

        let res = sleeper.await?;
        assert!(res.as_ref().is_err_and(IoError::is_cancelled), "{res:?}");
        Ok::<_, anyhow::Error>(())
    })??;

    Ok(())
}

#[test]
fn test_abort_drains_orphaned_request() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };
    let handle = ctx.handle();

    let joined = ctx.block_on(async move {
        let sleeper = handle.spawn(async {
            ops::sleep(Duration::from_secs(10)).await?;
            Ok::<_, IoError>("woke up")
        });

        yield_now().await;
        assert!(sleeper.abort());
        sleeper.await
    })?;

    assert!(matches!(joined, Err(JoinError::Cancelled(_))));

    // One more pass over the ring releases the orphan.
    ctx.block_on(ops::sleep(Duration::from_millis(50)))??;

    let scheduler = ctx.scheduler();
    assert_eq!(scheduler.num_orphans(), 0);
    assert_eq!(scheduler.outstanding(), 0);
    Ok(())
}

#[test]
fn test_abort_before_start() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };

    let never = ctx.spawn(async { 1 });
    assert!(ctx.abort(never.id()));
    assert!(!ctx.abort(never.id()));

    let res = ctx.block_on(never)?;
    assert!(res.is_err_and(|e| e.is_cancelled()));
    Ok(())
}

#[test]
fn test_nested_await() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };
    let handle = ctx.handle();

    let res = ctx.block_on(async move {
        let child = handle.spawn(async {
            ops::nop().await?;
            Ok::<_, IoError>(task::id())
        });
        let child_id = child.id();

        let grandchild_id = handle
            .spawn({
                let handle = handle.clone();
                async move { handle.spawn(async { task::id() }).await }
            })
            .await??;

        let seen = child.await??;
        assert_eq!(seen, child_id);
        assert_ne!(grandchild_id, child_id);

        let panicked = handle.spawn(async { boom("child failed") }).await;
        assert!(panicked.is_err_and(|e| e.is_panic()));
        Ok::<_, anyhow::Error>(())
    })?;

    assert!(res.is_ok());
    Ok(())
}

#[test]
fn test_child_beats_pending_sleep() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };
    let handle = ctx.handle();

    let start = Instant::now();
    let child_won = ctx.block_on(async move {
        let child = handle.spawn(async { ops::nop().await });
        let deadline = Box::pin(ops::sleep(Duration::from_secs(3)));

        match futures::future::select(child, deadline).await {
            futures::future::Either::Left((res, _)) => {
                res??;
                Ok::<_, anyhow::Error>(true)
            }
            futures::future::Either::Right(_) => Ok(false),
        }
    })??;

    assert!(child_won);
    assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());
    Ok(())
}

#[test]
fn test_yield_beats_pending_sleep() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };

    let start = Instant::now();
    ctx.block_on(async {
        let deadline = Box::pin(ops::sleep(Duration::from_secs(5)));
        let raced = futures::future::select(deadline, yield_now()).await;
        assert!(matches!(raced, futures::future::Either::Right(_)));
        drop(raced);

        // The abandoned sleep is cancelled before this goes out.
        ops::nop().await
    })??;

    assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());
    Ok(())
}

#[test]
fn test_concurrent_requests_in_one_task_are_rejected() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };

    let (first, second) = ctx.block_on(async {
        let id = task::id();
        let (first, second) = futures::join!(ops::nop(), ops::nop());
        (first, second.map_err(|e| (e, id)))
    })?;

    assert!(first.is_ok());
    assert!(matches!(second, Err((IoError::Busy(busy), id)) if busy == id));
    Ok(())
}

#[test]
fn test_detached_panic_is_fatal() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };

    drop(ctx.spawn(async { boom("nobody is watching") }));

    let res = ctx.block_on(async {
        yield_now().await;
    });
    assert!(
        matches!(res, Err(RuntimeError::UnhandledPanic { ref message, .. }) if message.contains("nobody is watching")),
        "{res:?}"
    );
    assert!(res.is_err_and(|e| e.is_fatal()));
    Ok(())
}

#[test]
fn test_deadlock_detected() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };
    let handle = ctx.handle();

    let res = ctx.block_on(async move {
        let root = task::id();
        let other = handle.spawn(WaitOn::new(root));

        // root and other now wait on each other.
        WaitOn::new(other.id()).await;
    });

    assert!(matches!(res, Err(RuntimeError::Deadlock)), "{res:?}");
    Ok(())
}

#[test]
fn test_one_context_per_thread() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };

    let cfg = RuntimeConfig::try_from(Builder::new().sq_ring_size(8))?;
    assert!(Context::try_new(cfg.clone()).is_err());

    drop(ctx);
    assert!(Context::try_new(cfg).is_ok());
    Ok(())
}

#[test]
fn test_stop_from_task() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };
    let handle = ctx.handle();

    drop(ctx.spawn(async move {
        ops::nop().await?;
        handle.stop();
        Ok::<_, IoError>(())
    }));

    ctx.run()?;
    assert_eq!(ctx.scheduler().num_tasks(), 0);
    Ok(())
}

#[test]
fn test_read_write_roundtrip() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };
    let tmp = tempfile::NamedTempFile::new()?;
    let path = tmp.path().to_owned();

    let data = ctx.block_on(async move {
        let fd = ops::openat(libc::AT_FDCWD, &path, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty()).await?;

        let written = ops::write(fd, b"completion based".to_vec(), 0).await?;
        let data = ops::read(fd, Vec::with_capacity(64), 0).await?;
        assert_eq!(written, data.len());

        ops::close(fd).await?;
        Ok::<_, IoError>(data)
    })??;

    assert_eq!(data, b"completion based");
    Ok(())
}

#[test]
fn test_direct_descriptor() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };

    let res = ctx.block_on(async {
        let slot = match ops::socket_direct(AddressFamily::Inet, SockType::Stream, SockFlag::empty(), None).await {
            Ok(slot) => slot,
            Err(e) if unsupported_opcode(&e) => return Ok(Either::Right(())),
            Err(e) => return Err(e),
        };

        ops::close(Target::Fixed(slot)).await?;

        // Closing again finds an empty slot.
        let again = ops::close(0) | Marker::direct();
        let res = again.await;
        assert!(res.is_err());
        Ok(Either::Left(slot))
    })?;

    if let Either::Left(slot) = res? {
        assert!(slot < 16);
    }
    Ok(())
}

#[test]
fn test_recv_multi_uses_buffer_pool() -> Result<()> {
    let Some(ctx) = context_or_skip(
        Builder::new()
            .sq_ring_size(16)
            .buf_size(16)
            .initial_entries(4)
            .max_entries(8)
            .share_kernel_workers(false),
    )?
    else {
        return Ok(());
    };

    if ctx.with_buffer_pool(|pool| pool.len()).is_none() {
        eprintln!("skipping: buffer ring unsupported by this kernel");
        return Ok(());
    }

    let (reader, mut writer) = UnixStream::pair()?;
    writer.write_all(b"0123456789abcdef0123456789")?;
    drop(writer);

    let fd = reader.as_raw_fd();
    let received = ctx.block_on(async move {
        let mut chunks = Vec::new();
        let mut stream = ops::recv_multi(fd, MsgFlags::empty());

        while let Some(item) = stream.next().await {
            let buf: PooledBuf = match item {
                Ok(buf) => buf,
                Err(e) if unsupported_opcode(&e) => return Ok(None),
                Err(e) => return Err(e),
            };
            chunks.extend_from_slice(&buf.to_bytes()?);
        }

        Ok(Some(chunks))
    })??;

    if let Some(received) = received {
        assert_eq!(received, b"0123456789abcdef0123456789");
        // Every slot went back to the kernel.
        let available = ctx.with_buffer_pool(|pool| pool.available());
        let len = ctx.with_buffer_pool(|pool| pool.len());
        assert_eq!(available, len);
    }

    drop(reader);
    Ok(())
}

#[test]
fn test_exhausted_pool_surfaces_enobufs() -> Result<()> {
    let Some(ctx) = context_or_skip(
        Builder::new()
            .sq_ring_size(16)
            .buf_size(4)
            .initial_entries(2)
            .max_entries(2)
            .share_kernel_workers(false),
    )?
    else {
        return Ok(());
    };

    if ctx.with_buffer_pool(|pool| pool.len()).is_none() {
        eprintln!("skipping: buffer ring unsupported by this kernel");
        return Ok(());
    }

    let (reader, mut writer) = UnixStream::pair()?;
    writer.write_all(b"0123456789abcdef")?;

    let fd = reader.as_raw_fd();
    let warnings = WarnCounter::new("buffer pool at capacity");
    let outcome = tracing::subscriber::with_default(warnings.clone(), || {
        ctx.block_on(async move {
            let mut held = Vec::new();
            let mut stream = ops::recv_multi(fd, MsgFlags::empty());

            while let Some(item) = stream.next().await {
                match item {
                    Ok(buf) => held.push(buf),
                    Err(e) if unsupported_opcode(&e) => return None,
                    Err(e) => return Some((held.len(), e)),
                }
            }

            panic!("stream ended without running out of buffers");
        })
    })?;

    if let Some((held, err)) = outcome {
        assert_eq!(held, 2);
        assert_eq!(err.raw_os_error(), Some(libc::ENOBUFS));
        assert_eq!(ctx.with_buffer_pool(|pool| pool.len()), Some(2));
        assert!(warnings.count() >= 1);
    }

    drop(writer);
    drop(reader);
    Ok(())
}

#[test]
fn test_cancel_sync_outside_task() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };

    let outcome = ctx.cancel_sync(CancelTarget::Any, true, Duration::from_millis(10));
    match outcome {
        CancelOutcome::Failed(libc::EINVAL) => eprintln!("skipping: sync cancel unsupported"),
        outcome => assert!(
            matches!(outcome, CancelOutcome::NotFound | CancelOutcome::Cancelled(0)),
            "{outcome:?}"
        ),
    }

    let outcome = ctx.cancel_sync(CancelTarget::Fd(Target::None), false, Duration::from_millis(10));
    assert_eq!(outcome, CancelOutcome::Failed(libc::EINVAL));
    Ok(())
}

#[test]
fn test_shutdown_cancels_outstanding() -> Result<()> {
    let Some(ctx) = small_context()? else {
        return Ok(());
    };

    let mut sleeper = ctx.spawn(ops::sleep(Duration::from_secs(10)));
    ctx.block_on(yield_now())?;
    assert_eq!(ctx.scheduler().outstanding(), 1);

    let start = Instant::now();
    ctx.shutdown();
    assert!(start.elapsed() < Duration::from_secs(5));

    assert!(sleeper.is_finished());
    assert!(matches!(sleeper.try_take(), Some(Err(JoinError::Cancelled(_)))));
    Ok(())
}
