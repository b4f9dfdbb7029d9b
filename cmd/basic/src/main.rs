//! Basic scheduler demo: fibers, yields and callback tasks.
//!
//! Run with `RUST_LOG=debug` to watch the dispatch loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::info;

use weft::{yield_now, Fiber, Scheduler};

fn main() -> Result<()> {
    flexi_logger::Logger::try_with_env_or_str("info")?.start()?;

    // Bare fiber outside any scheduler.
    let fiber = Fiber::new(
        || {
            info!("bare fiber: first half");
            yield_now();
            info!("bare fiber: second half");
        },
        0,
        false,
    )?;
    fiber.resume();
    info!("bare fiber yielded, resuming");
    fiber.resume();

    // A pool of workers chewing through callbacks.
    let sched = Scheduler::new(3, true, "basic");
    sched.start();

    let done = Arc::new(AtomicUsize::new(0));
    for i in 0..32 {
        let done = done.clone();
        sched.schedule(move || {
            if i % 2 == 0 {
                // Queue ourselves again before yielding, or the fiber is
                // abandoned mid-task.
                Scheduler::current()
                    .unwrap()
                    .schedule_fiber(Fiber::current());
                yield_now();
            }
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    sched.stop();
    info!("ran {} tasks", done.load(Ordering::SeqCst));
    Ok(())
}
