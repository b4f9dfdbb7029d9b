//! # weft-runtime
//!
//! The runtime behind the weft fiber framework:
//!
//! - Stackful fibers with explicit resume/yield (architecture-specific
//!   context switching, mmap'd guard-paged stacks)
//! - An N:M cooperative scheduler multiplexing fibers onto a worker pool
//! - An I/O manager extending the scheduler with an edge-triggered epoll
//!   reactor and a per-descriptor event table
//! - A deadline-ordered timer set feeding callbacks into the scheduler
//! - A process-wide fd registry and fiber-blocking I/O operations

pub mod arch;
pub mod fd;
pub mod fiber;
pub mod io;
pub mod ops;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

// Re-exports
pub use fd::{FdEntry, FdRegistry};
pub use fiber::{yield_now, Fiber};
pub use io::IoManager;
pub use scheduler::{current_thread_id, NoopDriver, Scheduler, SchedulerDriver};
pub use timer::{Timer, TimerManager};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
