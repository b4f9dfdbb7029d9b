//! Fiber-blocking I/O operations
//!
//! Typed wrappers that look blocking to the calling fiber while the worker
//! thread stays free. The pattern for every descriptor op:
//!
//! 1. Try the syscall (retrying EINTR in place).
//! 2. On EAGAIN, arm a condition timer over a shared attempt record if the
//!    fd has a timeout for this direction, register a one-shot readiness
//!    event with the current fiber as waiter, and yield.
//! 3. On wake, a marked record means the timer cancelled the wait: the op
//!    fails with `TimedOut`. Otherwise readiness arrived and the syscall is
//!    retried.
//!
//! Ops only engage on worker threads (where the scheduler enabled them) and
//! only for sockets the user did not mark non-blocking themselves; anything
//! else passes straight through to the kernel.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::error;

use weft_core::{Event, RuntimeConfig};

use crate::fd::{FdRegistry, TimeoutKind, NO_TIMEOUT};
use crate::fiber::{yield_now, Fiber};
use crate::io::IoManager;
use crate::tls;

/// Outcome slot shared between a waiting op and its watchdog timer.
#[derive(Default)]
struct AttemptRecord {
    /// 0, or the errno the timer path decided on (ETIMEDOUT).
    cancelled: AtomicI32,
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn check(n: isize) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Core wait-and-retry loop shared by all descriptor ops.
fn do_io(
    fd: RawFd,
    name: &str,
    event: Event,
    timeout_kind: TimeoutKind,
    mut op: impl FnMut() -> isize,
) -> io::Result<usize> {
    if !tls::ops_enabled() {
        return check(op());
    }
    let Some(entry) = FdRegistry::global().get(fd, true) else {
        return check(op());
    };
    if entry.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return check(op());
    }

    let timeout = entry.timeout_ms(timeout_kind);
    let record = Arc::new(AttemptRecord::default());

    loop {
        let mut n = op();
        while n == -1 && last_errno() == libc::EINTR {
            n = op();
        }
        if n >= 0 {
            return Ok(n as usize);
        }
        if last_errno() != libc::EAGAIN {
            return Err(io::Error::last_os_error());
        }

        let iom = IoManager::current().expect("fiber-blocking op without a current IoManager");

        // The timer only acts while the attempt record is still alive, so a
        // completed op cannot race a late expiry.
        let timer = (timeout != NO_TIMEOUT).then(|| {
            let winfo = Arc::downgrade(&record);
            let iom_t = iom.clone();
            iom.add_condition_timer(
                timeout,
                move || {
                    let Some(record) = winfo.upgrade() else {
                        return;
                    };
                    if record.cancelled.load(Ordering::Acquire) != 0 {
                        return;
                    }
                    record.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                    iom_t.cancel_event(fd, event);
                },
                Arc::downgrade(&record),
                false,
            )
        });

        if let Err(e) = iom.add_event(fd, event) {
            error!("{} add_event({}, {}) failed: {}", name, fd, event, e);
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return Err(io::Error::other(e));
        }

        // Two ways back: readiness fired, or the timer cancelled the event.
        yield_now();

        if let Some(timer) = &timer {
            timer.cancel();
        }
        let cancelled = record.cancelled.load(Ordering::Acquire);
        if cancelled != 0 {
            return Err(io::Error::from_raw_os_error(cancelled));
        }
    }
}

/// Read from `fd`, suspending the fiber until data or timeout.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || {
        unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) as isize }
    })
}

/// Write to `fd`, suspending the fiber until space or timeout.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || {
        unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) as isize }
    })
}

/// Receive from a socket.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || {
        unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) as isize }
    })
}

/// Send to a socket.
pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || {
        unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) as isize }
    })
}

/// Accept a connection; the new fd is entered into the registry.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let n = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || {
        unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as isize }
    })?;
    let newfd = n as RawFd;
    FdRegistry::global().get(newfd, true);
    Ok(newfd)
}

/// Create a socket and enter it into the registry.
pub fn socket(domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if tls::ops_enabled() {
        FdRegistry::global().get(fd, true);
    }
    Ok(fd)
}

/// Close `fd`: cancel outstanding events, drop registry state, close.
pub fn close(fd: RawFd) -> io::Result<()> {
    if tls::ops_enabled() {
        if let Some(entry) = FdRegistry::global().get(fd, false) {
            entry.mark_closed();
            if let Some(iom) = IoManager::current() {
                iom.cancel_all(fd);
            }
            FdRegistry::global().del(fd);
        }
    }
    if unsafe { libc::close(fd) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Connect with a deadline, suspending on write readiness.
///
/// `timeout_ms` of None selects the configured default.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: &SocketAddr,
    timeout_ms: Option<u64>,
) -> io::Result<()> {
    let (storage, len) = sockaddr_from(addr);
    let raw_connect =
        || unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };

    if !tls::ops_enabled() {
        return check(raw_connect() as isize).map(|_| ());
    }
    let Some(entry) = FdRegistry::global().get(fd, true) else {
        return check(raw_connect() as isize).map(|_| ());
    };
    if entry.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return check(raw_connect() as isize).map(|_| ());
    }

    if raw_connect() == 0 {
        return Ok(());
    }
    if last_errno() != libc::EINPROGRESS {
        return Err(io::Error::last_os_error());
    }

    let timeout = timeout_ms.unwrap_or(RuntimeConfig::get().connect_timeout_ms);
    let iom = IoManager::current().expect("connect_with_timeout without a current IoManager");
    let record = Arc::new(AttemptRecord::default());

    let timer = (timeout != NO_TIMEOUT).then(|| {
        let winfo = Arc::downgrade(&record);
        let iom_t = iom.clone();
        iom.add_condition_timer(
            timeout,
            move || {
                let Some(record) = winfo.upgrade() else {
                    return;
                };
                if record.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                record.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                iom_t.cancel_event(fd, Event::WRITE);
            },
            Arc::downgrade(&record),
            false,
        )
    });

    if let Err(e) = iom.add_event(fd, Event::WRITE) {
        error!("connect add_event({}, WRITE) failed: {}", fd, e);
        if let Some(timer) = &timer {
            timer.cancel();
        }
        return Err(io::Error::other(e));
    }

    yield_now();

    if let Some(timer) = &timer {
        timer.cancel();
    }
    let cancelled = record.cancelled.load(Ordering::Acquire);
    if cancelled != 0 {
        return Err(io::Error::from_raw_os_error(cancelled));
    }

    // Writability only says the attempt finished; SO_ERROR has the verdict.
    let mut err: libc::c_int = 0;
    let mut err_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rt = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut err_len,
        )
    };
    if rt == -1 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Suspend the calling fiber for `ms` milliseconds.
///
/// Outside a user fiber this degrades to a thread sleep.
pub fn sleep_ms(ms: u64) {
    let in_fiber = tls::current_fiber().is_some_and(|f| f.has_stack());
    let iom = IoManager::current();
    match iom {
        Some(iom) if in_fiber => {
            let fiber = Fiber::current();
            let sched = iom.scheduler().clone();
            iom.add_timer(ms, move || sched.schedule_fiber(fiber.clone()), false);
            yield_now();
        }
        _ => std::thread::sleep(Duration::from_millis(ms)),
    }
}

/// Suspend the calling fiber for `us` microseconds (millisecond granularity).
pub fn usleep(us: u64) {
    sleep_ms(us / 1000);
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}
