//! IoManager: readiness dispatch, one-shot discipline, cancellation laws.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_core::Event;
use weft_runtime::io::IoManager;

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn socket_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rt = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rt, 0);
    (fds[0], fds[1])
}

fn close_pair(pair: (RawFd, RawFd)) {
    unsafe {
        libc::close(pair.0);
        libc::close(pair.1);
    }
}

#[test]
fn read_readiness_fires_exactly_once() {
    let iom = IoManager::new(2, false, "io-s3").unwrap();
    let (rfd, wfd) = pipe_pair();

    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let log = log.clone();
        iom.add_event_cb(rfd, Event::READ, move || log.lock().unwrap().push("r"))
            .unwrap();
    }
    assert_eq!(iom.pending_event_count(), 1);

    // Writer runs as its own fiber.
    iom.schedule(move || {
        let rt = unsafe { libc::write(wfd, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(rt, 1);
    });

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*log.lock().unwrap(), vec!["r"]);
    assert_eq!(iom.pending_event_count(), 0);

    // One-shot: a second write without re-registration fires nothing.
    let rt = unsafe { libc::write(wfd, b"y".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(rt, 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(log.lock().unwrap().len(), 1);

    iom.stop();
    close_pair((rfd, wfd));
}

#[test]
fn del_event_discards_without_invoking() {
    let iom = IoManager::new(1, false, "io-del").unwrap();
    let (rfd, wfd) = pipe_pair();

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        iom.add_event_cb(rfd, Event::READ, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert_eq!(iom.pending_event_count(), 1);

    assert!(iom.del_event(rfd, Event::READ));
    assert_eq!(iom.pending_event_count(), 0);

    // Readiness after deletion reaches nobody.
    let rt = unsafe { libc::write(wfd, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(rt, 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // And the slate is clean for a fresh registration.
    {
        let fired = fired.clone();
        iom.add_event_cb(rfd, Event::READ, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    iom.stop();
    close_pair((rfd, wfd));
}

#[test]
fn del_event_on_unregistered_returns_false() {
    let iom = IoManager::new(1, false, "io-del2").unwrap();
    let (rfd, _wfd) = pipe_pair();

    assert!(!iom.del_event(rfd, Event::READ));
    assert!(!iom.cancel_event(rfd, Event::WRITE));
    assert!(!iom.cancel_all(rfd));

    iom.stop();
    close_pair((rfd, _wfd));
}

#[test]
fn cancel_event_invokes_exactly_once() {
    let iom = IoManager::new(1, false, "io-cancel").unwrap();
    let (rfd, wfd) = pipe_pair();

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        iom.add_event_cb(rfd, Event::READ, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(iom.cancel_event(rfd, Event::READ));
    assert_eq!(iom.pending_event_count(), 0);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Later readiness must not double-fire.
    let rt = unsafe { libc::write(wfd, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(rt, 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    iom.stop();
    close_pair((rfd, wfd));
}

#[test]
fn cancel_all_fires_every_direction_once() {
    let iom = IoManager::new(1, false, "io-cancel-all").unwrap();
    let (a, b) = socket_pair();

    // Make WRITE on `a` genuinely not-ready by saturating its send buffer,
    // so neither direction can fire through the poller first.
    unsafe {
        let flags = libc::fcntl(a, libc::F_GETFL, 0);
        libc::fcntl(a, libc::F_SETFL, flags | libc::O_NONBLOCK);
        let size: libc::c_int = 4096;
        libc::setsockopt(
            a,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        let junk = [0u8; 8192];
        while libc::write(a, junk.as_ptr() as *const libc::c_void, junk.len()) > 0 {}
    }

    let reads = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));
    {
        let reads = reads.clone();
        iom.add_event_cb(a, Event::READ, move || {
            reads.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    {
        let writes = writes.clone();
        iom.add_event_cb(a, Event::WRITE, move || {
            writes.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert_eq!(iom.pending_event_count(), 2);

    assert!(iom.cancel_all(a));
    assert_eq!(iom.pending_event_count(), 0);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert_eq!(writes.load(Ordering::SeqCst), 1);

    iom.stop();
    close_pair((a, b));
}

#[test]
fn both_directions_dispatch_independently() {
    let iom = IoManager::new(2, false, "io-both").unwrap();
    let (a, b) = socket_pair();

    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let log = log.clone();
        iom.add_event_cb(a, Event::READ, move || log.lock().unwrap().push("read"))
            .unwrap();
    }
    {
        // A fresh socketpair buffer is writable immediately.
        let log = log.clone();
        iom.add_event_cb(a, Event::WRITE, move || log.lock().unwrap().push("write"))
            .unwrap();
    }

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*log.lock().unwrap(), vec!["write"]);
    assert_eq!(iom.pending_event_count(), 1);

    let rt = unsafe { libc::write(b, b"z".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(rt, 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*log.lock().unwrap(), vec!["write", "read"]);
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    close_pair((a, b));
}
