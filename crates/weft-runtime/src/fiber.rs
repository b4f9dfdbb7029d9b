//! Stackful fibers with explicit resume/yield
//!
//! A fiber owns a private stack and a saved machine context. `resume`
//! transfers control into the fiber from its "home" fiber; `yield_now`
//! transfers back. Fibers flagged `run_in_scheduler` switch against the
//! thread's scheduling fiber, everything else against the thread-main fiber
//! (the thread's original stack), so bare fibers work outside any scheduler.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error};

use weft_core::{FiberId, FiberState, SchedResult};

use crate::arch::{self, Context};
use crate::stack::Stack;
use crate::tls;

pub(crate) type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Count of live fibers, for diagnostics.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// A cooperatively scheduled execution context.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    run_in_scheduler: bool,
    stack: Option<Stack>,
    ctx: UnsafeCell<Context>,
    entry: UnsafeCell<Option<FiberFn>>,
}

// Safety: `ctx` and `entry` are only touched by the thread that currently
// owns execution of this fiber; resume/yield strictly serialize that
// ownership through the state machine.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a user fiber that will run `entry` on first resume.
    ///
    /// `stack_size` 0 selects the configured default. Fibers created with
    /// `run_in_scheduler = true` must only be resumed from a scheduler
    /// thread.
    pub fn new(
        entry: impl FnOnce() + Send + 'static,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> SchedResult<Arc<Fiber>> {
        Self::from_boxed(Box::new(entry), stack_size, run_in_scheduler)
    }

    pub(crate) fn from_boxed(
        entry: FiberFn,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> SchedResult<Arc<Fiber>> {
        let stack = Stack::alloc(stack_size)?;
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            stack: Some(stack),
            ctx: UnsafeCell::new(Context::new()),
            entry: UnsafeCell::new(Some(entry)),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        let top = fiber.stack.as_ref().map(Stack::top).unwrap_or(std::ptr::null_mut());
        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                top,
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        debug!("fiber {} created", fiber.id);
        Ok(fiber)
    }

    /// The thread-main fiber: no stack of its own, represents the thread's
    /// original stack and starts out running.
    fn main_fiber() -> Fiber {
        Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Running as u8),
            run_in_scheduler: false,
            stack: None,
            ctx: UnsafeCell::new(Context::new()),
            entry: UnsafeCell::new(None),
        }
    }

    /// The fiber currently executing on this thread.
    ///
    /// Bootstraps the thread-main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current_fiber() {
            return f;
        }
        let main = Arc::new(Fiber::main_fiber());
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        debug!("fiber {} created (thread main)", main.id);
        tls::set_thread_main_fiber(main.clone());
        tls::set_current_fiber(main.clone());
        main
    }

    /// Id of the fiber running on this thread, or [`FiberId::NONE`].
    pub fn current_id() -> FiberId {
        tls::current_fiber().map(|f| f.id).unwrap_or(FiberId::NONE)
    }

    /// Number of live fibers in the process.
    pub fn count() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn runs_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    /// Whether this fiber owns its own stack (false only for thread-main).
    #[inline]
    pub(crate) fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// Transfer control into this fiber from its home fiber.
    ///
    /// Returns when the fiber yields or its entry returns. Resuming a
    /// RUNNING or TERM fiber is a programming error.
    pub fn resume(self: &Arc<Self>) {
        let st = self.state();
        assert!(
            st != FiberState::Running && st != FiberState::Term,
            "resume on {:?} fiber {}",
            st,
            self.id
        );
        let home = self.home_fiber();
        tls::set_current_fiber(self.clone());
        self.set_state(FiberState::Running);

        let save = home.ctx.get();
        let restore = self.ctx.get();
        // Only raw pointers cross the switch; TLS keeps `home` alive and the
        // caller's Arc keeps `self` alive.
        drop(home);
        unsafe { arch::context_switch(save, restore) };
    }

    /// Give control back to the home fiber.
    ///
    /// State RUNNING becomes READY; TERM is preserved (termination path).
    pub(crate) fn yield_inner(&self) {
        let st = self.state();
        assert!(
            st == FiberState::Running || st == FiberState::Term,
            "yield on {:?} fiber {}",
            st,
            self.id
        );
        if st != FiberState::Term {
            self.set_state(FiberState::Ready);
        }
        let home = self.home_fiber();
        tls::set_current_fiber(home.clone());

        let save = self.ctx.get();
        let restore = home.ctx.get();
        drop(home);
        unsafe { arch::context_switch(save, restore) };
    }

    /// Re-arm a terminated fiber with a new entry callback.
    ///
    /// Only valid on TERM fibers that own a stack.
    pub fn reset(self: &Arc<Self>, entry: impl FnOnce() + Send + 'static) {
        self.reset_boxed(Box::new(entry));
    }

    pub(crate) fn reset_boxed(self: &Arc<Self>, entry: FiberFn) {
        assert!(self.stack.is_some(), "reset on stackless fiber {}", self.id);
        assert_eq!(
            self.state(),
            FiberState::Term,
            "reset on non-terminated fiber {}",
            self.id
        );
        let top = self.stack.as_ref().map(Stack::top).unwrap_or(std::ptr::null_mut());
        unsafe {
            *self.entry.get() = Some(entry);
            arch::init_context(self.ctx.get(), top, fiber_entry as usize, Arc::as_ptr(self) as usize);
        }
        self.set_state(FiberState::Ready);
    }

    /// Switch partner: the scheduling fiber for scheduler fibers, the
    /// thread-main fiber otherwise.
    fn home_fiber(&self) -> Arc<Fiber> {
        if self.run_in_scheduler {
            tls::scheduling_fiber()
                .expect("scheduler fiber resumed/yielded outside a scheduler thread")
        } else {
            match tls::thread_main_fiber() {
                Some(f) => f,
                // First bare resume on this thread: current() bootstraps the
                // thread-main fiber.
                None => Fiber::current(),
            }
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            // TERM after running, or READY if discarded before dispatch.
            assert!(
                self.state() != FiberState::Running,
                "dropping running fiber {}",
                self.id
            );
        }
        debug!("fiber {} destroyed", self.id);
    }
}

/// Yield the currently running fiber back to its home fiber.
///
/// Outside any fiber (or on the thread-main fiber itself) this degrades to
/// an OS-level thread yield.
pub fn yield_now() {
    match tls::current_fiber() {
        Some(cur) if cur.stack.is_some() => {
            let raw = Arc::as_ptr(&cur);
            // Drop our handle before switching; the resume() caller's strong
            // reference keeps the fiber alive across the suspension.
            drop(cur);
            unsafe { (*raw).yield_inner() };
        }
        _ => std::thread::yield_now(),
    }
}

/// First frame of every user fiber.
///
/// Runs the entry callback, marks the fiber TERM and switches home for good.
extern "C" fn fiber_entry(arg: usize) {
    // Safety: the resume() caller holds a strong reference for the whole
    // window this fiber executes, so the pointer stays valid. No Arc is kept
    // in this frame: it never unwinds, and a held clone would leak.
    let fiber = unsafe { &*(arg as *const Fiber) };

    let entry = unsafe { (*fiber.entry.get()).take() };
    if let Some(entry) = entry {
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)) {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            error!("fiber {} entry panicked: {}", fiber.id, msg);
        }
    }

    fiber.set_state(FiberState::Term);
    fiber.yield_inner();
    unreachable!("terminated fiber {} resumed", fiber.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_bootstraps_thread_main() {
        let main = Fiber::current();
        assert_eq!(main.state(), FiberState::Running);
        assert!(!main.runs_in_scheduler());
        assert_eq!(Fiber::current().id(), main.id());
    }

    #[test]
    fn test_resume_runs_entry_to_term() {
        let fiber = Fiber::new(|| {}, 16 * 1024, false).unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let h = hits.clone();
        let fiber = Fiber::new(move || { h.fetch_add(1, Ordering::SeqCst); }, 16 * 1024, false).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let h = hits.clone();
        fiber.reset(move || { h.fetch_add(10, Ordering::SeqCst); });
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();

        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }
}
