//! N:M cooperative fiber scheduler
//!
//! A shared FIFO task queue dispatched by a pool of worker threads, each
//! running the same loop: take one task, resume it, and when the queue is
//! empty resume the per-thread idle fiber. With `use_caller` the
//! constructing thread joins the pool at `stop()` time through a dedicated
//! root fiber.
//!
//! Poll/wake behavior is pluggable through [`SchedulerDriver`]: the base
//! [`NoopDriver`] busy-yields in idle, while the I/O manager installs a
//! driver that blocks in the readiness poller and wakes workers through a
//! self-pipe.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error};

use weft_core::FiberState;

use crate::fiber::{yield_now, Fiber, FiberFn};
use crate::tls;

/// OS thread id of the calling thread.
pub fn current_thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

/// Set the kernel-visible thread name, truncated to 15 bytes.
fn set_os_thread_name(name: &str) {
    let mut buf = [0u8; 16];
    let n = name.len().min(15);
    buf[..n].copy_from_slice(&name.as_bytes()[..n]);
    unsafe {
        libc::prctl(libc::PR_SET_NAME, buf.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
}

/// One unit of schedulable work.
pub(crate) enum Job {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

/// A queued job, optionally pinned to one worker thread.
struct ScheduleTask {
    job: Job,
    target: Option<u64>,
}

/// Poll/wake capability consumed by the dispatch loop.
pub trait SchedulerDriver: Send + Sync + 'static {
    /// Wake one worker blocked in the idle path.
    fn tickle(&self);

    /// Body of the per-worker idle fiber. Must keep yielding until
    /// [`Scheduler::stopping`] holds, then return.
    fn idle(&self, sched: &Arc<Scheduler>);

    /// Extra stop condition AND-composed into [`Scheduler::stopping`].
    fn extra_stopping(&self) -> bool {
        true
    }

    /// Called on each scheduler thread before it starts dispatching.
    fn on_thread_start(&self, _sched: &Arc<Scheduler>) {}
}

/// Default driver: no wakeup machinery, idle busy-yields.
pub struct NoopDriver;

impl SchedulerDriver for NoopDriver {
    fn tickle(&self) {
        debug!("tickle");
    }

    fn idle(&self, sched: &Arc<Scheduler>) {
        debug!("idle");
        while !sched.stopping() {
            yield_now();
        }
    }
}

/// Cooperative scheduler over a fixed worker pool.
pub struct Scheduler {
    name: String,
    thread_count: usize,
    use_caller: bool,
    root_thread: Option<u64>,
    driver: Arc<dyn SchedulerDriver>,

    queue: Mutex<VecDeque<ScheduleTask>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    thread_ids: Mutex<Vec<u64>>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,

    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stopping: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler with the default (no-op) driver.
    ///
    /// `threads` counts the caller thread when `use_caller` is set; it must
    /// be at least 1.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Self::with_driver(threads, use_caller, name, Arc::new(NoopDriver))
    }

    /// Create a scheduler with a custom poll/wake driver.
    pub fn with_driver(
        threads: usize,
        use_caller: bool,
        name: &str,
        driver: Arc<dyn SchedulerDriver>,
    ) -> Arc<Scheduler> {
        assert!(threads > 0);
        let thread_count = if use_caller { threads - 1 } else { threads };

        let sched = Arc::new(Scheduler {
            name: name.to_string(),
            thread_count,
            use_caller,
            root_thread: use_caller.then(current_thread_id),
            driver,
            queue: Mutex::new(VecDeque::new()),
            handles: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            root_fiber: Mutex::new(None),
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
        });

        if use_caller {
            // The caller thread becomes a worker: bootstrap its thread-main
            // fiber and give it a scheduling fiber that runs the dispatch
            // loop when stop() drains.
            Fiber::current();
            debug_assert!(tls::current_scheduler().is_none());
            tls::set_current_scheduler(&sched);

            let weak = Arc::downgrade(&sched);
            let root = Fiber::new(
                move || {
                    if let Some(s) = weak.upgrade() {
                        s.run();
                    }
                },
                0,
                false,
            )
            .expect("failed to allocate root fiber");
            tls::set_scheduling_fiber(root.clone());
            *sched.root_fiber.lock().unwrap() = Some(root);
            sched.thread_ids.lock().unwrap().push(current_thread_id());
        }

        sched
    }

    /// The scheduler driving the calling thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::current_scheduler()
    }

    /// The scheduling fiber of the calling thread, if any.
    pub fn current_scheduling_fiber() -> Option<Arc<Fiber>> {
        tls::scheduling_fiber()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS thread ids participating in this scheduler.
    pub fn thread_ids(&self) -> Vec<u64> {
        self.thread_ids.lock().unwrap().clone()
    }

    /// Number of workers currently dispatching a task.
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Whether any worker is parked in its idle fiber.
    pub fn has_idle_threads(&self) -> bool {
        self.idle_count.load(Ordering::SeqCst) > 0
    }

    /// Queue a callback for execution on any worker.
    pub fn schedule(&self, cb: impl FnOnce() + Send + 'static) {
        self.enqueue(Job::Call(Box::new(cb)), None);
    }

    /// Queue a callback pinned to the worker with OS thread id `thread`.
    pub fn schedule_on(&self, cb: impl FnOnce() + Send + 'static, thread: u64) {
        self.enqueue(Job::Call(Box::new(cb)), Some(thread));
    }

    /// Queue a fiber for execution on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.enqueue(Job::Fiber(fiber), None);
    }

    /// Queue a fiber pinned to the worker with OS thread id `thread`.
    pub fn schedule_fiber_on(&self, fiber: Arc<Fiber>, thread: u64) {
        self.enqueue(Job::Fiber(fiber), Some(thread));
    }

    pub(crate) fn enqueue(&self, job: Job, target: Option<u64>) {
        let need_tickle = {
            let mut queue = self.queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(ScheduleTask { job, target });
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Wake one worker through the installed driver.
    pub fn tickle(&self) {
        self.driver.tickle();
    }

    /// Spawn the worker threads.
    pub fn start(self: &Arc<Self>) {
        debug!("scheduler {} start", self.name);
        let mut handles = self.handles.lock().unwrap();
        if self.stopping.load(Ordering::SeqCst) {
            error!("scheduler {} start while stopping", self.name);
            return;
        }
        assert!(handles.is_empty());

        for i in 0..self.thread_count {
            let me = self.clone();
            let thread_name = format!("{}_{}", self.name, i);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    set_os_thread_name(&thread_name);
                    me.thread_ids.lock().unwrap().push(current_thread_id());
                    me.run();
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
    }

    /// Stop the scheduler: drain the queue, then join every worker.
    ///
    /// With `use_caller`, must be invoked from the constructing thread,
    /// which dispatches remaining work itself before the join.
    pub fn stop(self: &Arc<Self>) {
        debug!("scheduler {} stop", self.name);
        if self.stopping() {
            return;
        }
        self.stopping.store(true, Ordering::SeqCst);

        if self.use_caller {
            debug_assert!(Scheduler::current().is_some_and(|s| Arc::ptr_eq(&s, self)));
        }

        for _ in 0..self.thread_count {
            self.tickle();
        }

        let root_fiber = self.root_fiber.lock().unwrap().clone();
        if root_fiber.is_some() {
            self.tickle();
        }
        if let Some(root) = root_fiber {
            if root.state() != FiberState::Term {
                // The caller thread drains the queue itself.
                root.resume();
                debug!("scheduler {} root fiber end", self.name);
            }
        }

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// True once stop was requested, the queue is drained, no worker is
    /// mid-task, and the driver has no pending work.
    pub fn stopping(&self) -> bool {
        self.driver.extra_stopping() && self.base_stopping()
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active_count.load(Ordering::SeqCst) == 0
    }

    /// Per-thread dispatch loop.
    fn run(self: &Arc<Self>) {
        debug!("scheduler {} run", self.name);
        tls::set_ops_enabled(true);
        tls::set_current_scheduler(self);
        self.driver.on_thread_start(self);

        let tid = current_thread_id();
        if self.root_thread != Some(tid) {
            // Worker thread: its scheduling fiber is the thread-main fiber.
            tls::set_scheduling_fiber(Fiber::current());
        }

        let driver = self.driver.clone();
        let me = self.clone();
        let idle_fiber =
            Fiber::new(move || driver.idle(&me), 0, true).expect("failed to allocate idle fiber");
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task: Option<Job> = None;
            let mut tickle_me = false;
            {
                let mut queue = self.queue.lock().unwrap();
                let mut idx = 0;
                while idx < queue.len() {
                    let t = &queue[idx];

                    // Pinned to another thread: leave it, wake someone.
                    if t.target.is_some_and(|want| want != tid) {
                        idx += 1;
                        tickle_me = true;
                        continue;
                    }

                    // A fiber can still be RUNNING when its wakeup raced the
                    // yield: event registered, fired on another thread
                    // before the owner finished switching out. Skip it for
                    // now; it becomes dispatchable once the yield lands.
                    if let Job::Fiber(f) = &t.job {
                        if f.state() == FiberState::Running {
                            idx += 1;
                            tickle_me = true;
                            continue;
                        }
                    }

                    task = Some(queue.remove(idx).unwrap().job);
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me |= idx < queue.len();
            }

            if tickle_me {
                self.tickle();
            }

            match task {
                Some(Job::Fiber(fiber)) => {
                    fiber.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Job::Call(cb)) => {
                    let fiber = match cb_fiber.take() {
                        Some(f) => {
                            f.reset_boxed(cb);
                            f
                        }
                        None => Fiber::from_boxed(cb, 0, true)
                            .expect("failed to allocate callback fiber"),
                    };
                    fiber.resume();
                    // Reuse only when the callback ran to completion; a
                    // yielded callback fiber is parked elsewhere.
                    if fiber.state() == FiberState::Term {
                        cb_fiber = Some(fiber);
                    }
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        // idle only terminates once the scheduler is stopping
                        debug!("scheduler {} idle fiber term", self.name);
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_count.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        debug!("scheduler {} run end", self.name);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug!("scheduler {} dropped", self.name);
    }
}
