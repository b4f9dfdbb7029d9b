//! Thread-local runtime context
//!
//! All cross-component references flow through these slots instead of owning
//! back-pointers: the running fiber, the thread-main fiber, the scheduling
//! fiber, and borrowed (weak) handles to the scheduler and I/O driver of the
//! current worker.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use crate::fiber::Fiber;
use crate::io::IoDriver;
use crate::scheduler::Scheduler;

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's original-stack fiber
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduling fiber: switch partner for fibers that run in a scheduler
    static SCHEDULING_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduler driving this thread
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };

    /// I/O driver of the IoManager driving this thread
    static CURRENT_IO: RefCell<Option<Weak<IoDriver>>> = const { RefCell::new(None) };

    /// Whether fiber-blocking ops are redirected through the I/O manager
    static OPS_ENABLED: Cell<bool> = const { Cell::new(false) };
}

#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub(crate) fn set_current_fiber(fiber: Arc<Fiber>) {
    CURRENT_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

#[inline]
pub(crate) fn thread_main_fiber() -> Option<Arc<Fiber>> {
    THREAD_MAIN.with(|cell| cell.borrow().clone())
}

#[inline]
pub(crate) fn set_thread_main_fiber(fiber: Arc<Fiber>) {
    THREAD_MAIN.with(|cell| *cell.borrow_mut() = Some(fiber));
}

/// The scheduling fiber of this thread, if a scheduler runs here.
#[inline]
pub fn scheduling_fiber() -> Option<Arc<Fiber>> {
    SCHEDULING_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub(crate) fn set_scheduling_fiber(fiber: Arc<Fiber>) {
    SCHEDULING_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

/// The scheduler driving this thread, if any.
#[inline]
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
}

#[inline]
pub(crate) fn set_current_scheduler(sched: &Arc<Scheduler>) {
    CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = Some(Arc::downgrade(sched)));
}

#[inline]
pub(crate) fn current_io_driver() -> Option<Arc<IoDriver>> {
    CURRENT_IO.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
}

#[inline]
pub(crate) fn set_current_io_driver(driver: Weak<IoDriver>) {
    CURRENT_IO.with(|cell| *cell.borrow_mut() = Some(driver));
}

/// Whether fiber-blocking ops on this thread go through the I/O manager.
#[inline]
pub fn ops_enabled() -> bool {
    OPS_ENABLED.with(|cell| cell.get())
}

/// Enable or disable op redirection for this thread.
#[inline]
pub fn set_ops_enabled(enabled: bool) {
    OPS_ENABLED.with(|cell| cell.set(enabled));
}
