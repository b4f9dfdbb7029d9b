//! I/O manager demo: timers and pipe readiness round-trips.
//!
//! A writer fiber sleeps on timers and feeds a pipe; a reader fiber blocks
//! on read readiness and echoes what arrives.

use std::os::fd::RawFd;

use anyhow::Result;
use log::info;

use weft::{ops, Event, IoManager};

fn pipe_pair() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        anyhow::bail!("pipe failed: {}", std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn main() -> Result<()> {
    flexi_logger::Logger::try_with_env_or_str("info")?.start()?;

    let iom = IoManager::new(2, false, "echo")?;
    let (rfd, wfd) = pipe_pair()?;

    // Reader: one-shot registrations, re-armed after every message.
    {
        let iom_r = iom.clone();
        fn arm_reader(iom: &IoManager, rfd: RawFd, round: u32) {
            let iom2 = iom.clone();
            iom.add_event_cb(rfd, Event::READ, move || {
                let mut buf = [0u8; 64];
                let n = unsafe { libc::read(rfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n > 0 {
                    info!(
                        "reader: round {} got {:?}",
                        round,
                        String::from_utf8_lossy(&buf[..n as usize])
                    );
                }
                if round < 3 {
                    arm_reader(&iom2, rfd, round + 1);
                }
            })
            .expect("register read interest");
        }
        arm_reader(&iom_r, rfd, 0);
    }

    // Writer: a fiber that sleeps between messages.
    let iom_w = iom.clone();
    iom.schedule(move || {
        for i in 0..4 {
            ops::sleep_ms(50);
            let msg = format!("ping {}", i);
            let rt = unsafe {
                libc::write(wfd, msg.as_ptr() as *const libc::c_void, msg.len())
            };
            assert_eq!(rt as usize, msg.len());
        }
        // Give the last read a moment, then wind down.
        iom_w.add_timer(100, {
            let iom = iom_w.clone();
            move || info!("demo done, {} events pending", iom.pending_event_count())
        }, false);
    });

    std::thread::sleep(std::time::Duration::from_millis(500));
    iom.stop();

    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
    Ok(())
}
