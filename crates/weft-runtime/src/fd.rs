//! Process-wide file descriptor registry
//!
//! Tracks per-fd metadata consumed by the fiber-blocking ops: whether the
//! descriptor is a socket, whether the *user* asked for non-blocking mode
//! (as opposed to the OS-level flag the runtime forces on sockets), and the
//! per-direction timeouts.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Sentinel for "no timeout configured".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// I/O direction for timeout lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Metadata for one open descriptor.
pub struct FdEntry {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    is_closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdEntry {
    /// Probe an open descriptor.
    ///
    /// Returns None if `fd` is not open. Sockets get the OS-level
    /// non-blocking flag forced on, without touching the user-visible flag.
    fn probe(fd: RawFd) -> Option<FdEntry> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } == -1 {
            return None;
        }
        let is_socket = stat.st_mode & libc::S_IFMT == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        Some(FdEntry {
            fd,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// Whether the runtime forced O_NONBLOCK on this descriptor.
    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    /// Record that the user asked for non-blocking mode themselves.
    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::Relaxed);
    }

    /// Timeout for one direction; [`NO_TIMEOUT`] means wait forever.
    pub fn timeout_ms(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

/// Lazy registry of [`FdEntry`]s indexed by descriptor.
pub struct FdRegistry {
    entries: RwLock<Vec<Option<Arc<FdEntry>>>>,
}

static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();

impl FdRegistry {
    fn new() -> FdRegistry {
        FdRegistry {
            entries: RwLock::new(vec![None; 64]),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static FdRegistry {
        REGISTRY.get_or_init(FdRegistry::new)
    }

    /// Look up the entry for `fd`, creating it when `auto_create` is set and
    /// the descriptor is actually open.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        {
            let entries = self.entries.read().unwrap();
            if let Some(slot) = entries.get(fd as usize) {
                if slot.is_some() || !auto_create {
                    return slot.clone();
                }
            } else if !auto_create {
                return None;
            }
        }

        let entry = Arc::new(FdEntry::probe(fd)?);
        let mut entries = self.entries.write().unwrap();
        if fd as usize >= entries.len() {
            let grown = (fd as usize * 3 / 2).max(fd as usize + 1);
            entries.resize(grown, None);
        }
        entries[fd as usize] = Some(entry.clone());
        Some(entry)
    }

    /// Drop the entry for `fd`.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut entries = self.entries.write().unwrap();
        if let Some(slot) = entries.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_fd_yields_no_entry() {
        let reg = FdRegistry::new();
        assert!(reg.get(-1, true).is_none());
        // fd 9999 is (almost certainly) not open
        assert!(reg.get(9999, true).is_none());
    }

    #[test]
    fn test_pipe_fd_is_not_socket() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let reg = FdRegistry::new();
        let entry = reg.get(fds[0], true).unwrap();
        assert!(!entry.is_socket());
        assert!(!entry.sys_nonblock());

        reg.del(fds[0]);
        assert!(reg.get(fds[0], false).is_none());

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let reg = FdRegistry::new();
        let entry = reg.get(fd, true).unwrap();
        assert!(entry.is_socket());
        assert!(entry.sys_nonblock());
        assert!(!entry.user_nonblock());

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        assert_eq!(entry.timeout_ms(TimeoutKind::Recv), NO_TIMEOUT);
        entry.set_timeout_ms(TimeoutKind::Recv, 50);
        assert_eq!(entry.timeout_ms(TimeoutKind::Recv), 50);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_registry_grows() {
        let reg = FdRegistry::new();
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        // Push the same open fd through a dup to a high slot.
        let high = unsafe { libc::fcntl(fd, libc::F_DUPFD, 200) };
        assert!(high >= 200);

        assert!(reg.get(high, true).is_some());
        assert!(reg.get(high, false).is_some());

        unsafe {
            libc::close(fd);
            libc::close(high);
        }
    }
}
