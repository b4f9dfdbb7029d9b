//! # weft
//!
//! A cooperative fiber runtime for network services: many lightweight
//! stackful fibers multiplexed onto a small pool of worker threads, with an
//! edge-triggered epoll reactor and deadline-ordered timers driving wakeups.
//!
//! ```no_run
//! use weft::{ops, IoManager};
//!
//! let iom = IoManager::new(2, false, "io").unwrap();
//! iom.schedule(|| {
//!     // Looks blocking, suspends only this fiber.
//!     ops::sleep_ms(100);
//!     println!("tick");
//! });
//! iom.stop();
//! ```

pub use weft_core::{Event, FiberId, FiberState, RuntimeConfig, SchedError, SchedResult};

pub use weft_runtime::fd::{FdEntry, FdRegistry, TimeoutKind, NO_TIMEOUT};
pub use weft_runtime::fiber::{yield_now, Fiber};
pub use weft_runtime::io::IoManager;
pub use weft_runtime::ops;
pub use weft_runtime::scheduler::{
    current_thread_id, NoopDriver, Scheduler, SchedulerDriver,
};
pub use weft_runtime::timer::{Timer, TimerManager};
