//! Readiness poller over epoll
//!
//! A thin wrapper translating errno into results. Callers always register
//! in edge-triggered mode; one registration fires at most once.

use std::os::fd::RawFd;

use weft_core::{SchedError, SchedResult};

/// Last OS error as a raw errno.
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Label for an epoll_ctl op, for error logs.
pub(crate) fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "EPOLL_CTL_ADD",
        libc::EPOLL_CTL_MOD => "EPOLL_CTL_MOD",
        libc::EPOLL_CTL_DEL => "EPOLL_CTL_DEL",
        _ => "EPOLL_CTL_?",
    }
}

pub(crate) struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> SchedResult<Poller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SchedError::PollerCreate(last_errno()));
        }
        Ok(Poller { epfd })
    }

    /// Register, reprogram or remove `fd`. `token` comes back in
    /// `epoll_event.u64` on readiness.
    pub fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> Result<(), i32> {
        let mut ev = libc::epoll_event { events, u64: token };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            Err(last_errno())
        } else {
            Ok(())
        }
    }

    /// Wait up to `timeout_ms` for readiness. Returns the number of filled
    /// entries, or the raw errno (callers retry EINTR in place).
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> Result<usize, i32> {
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if n < 0 {
            Err(last_errno())
        } else {
            Ok(n as usize)
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
