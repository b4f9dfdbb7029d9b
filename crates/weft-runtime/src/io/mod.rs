//! I/O manager: scheduler + readiness reactor + timers
//!
//! [`IoManager`] couples a [`Scheduler`] with an epoll-based reactor. Each
//! worker's idle fiber blocks in the poller with a timeout bounded by the
//! next timer deadline (5 s ceiling); on wake it drains expired timers and
//! dispatches ready events back into the scheduler. Event registrations are
//! one-shot: firing an event clears its bit and its waiter, and staying
//! interested means registering again.
//!
//! New work wakes a sleeping poller by writing one byte to a self-pipe
//! whose read end is registered for edge-triggered read readiness.

pub(crate) mod poller;

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use log::{debug, error, warn};

use weft_core::{Event, FiberState, SchedError, SchedResult};

use crate::fiber::{yield_now, Fiber, FiberFn};
use crate::scheduler::{Job, Scheduler, SchedulerDriver};
use crate::timer::{Timer, TimerFn, TimerManager};
use crate::tls;

use poller::{last_errno, op_name, Poller};

/// Poller sleep ceiling, even when no timer is due sooner.
const MAX_TIMEOUT_MS: u64 = 5000;

/// epoll token of the self-pipe read end; context pointers are never 0.
const TICKLE_TOKEN: u64 = 0;

/// Waiter for one direction of one descriptor: the scheduler to wake into
/// and either a stored callback or the suspended fiber.
#[derive(Default)]
struct EventCtx {
    scheduler: Option<Weak<Scheduler>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
}

impl EventCtx {
    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }
}

#[derive(Default)]
struct FdContextInner {
    events: Event,
    read: EventCtx,
    write: EventCtx,
}

impl FdContextInner {
    fn event_ctx(&mut self, event: Event) -> &mut EventCtx {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            panic!("unknown event {}", event);
        }
    }

    /// Clear `event`'s bit and take its waiter for scheduling.
    ///
    /// One-shot discipline: re-arming requires a fresh registration.
    fn take_triggered(&mut self, event: Event) -> Option<(Arc<Scheduler>, Job)> {
        assert!(
            self.events.contains(event),
            "trigger on unregistered event {}",
            event
        );
        self.events = self.events - event;

        let ctx = self.event_ctx(event);
        let scheduler = ctx.scheduler.take().and_then(|w| w.upgrade());
        let job = match ctx.cb.take() {
            Some(cb) => Some(Job::Call(cb)),
            None => ctx.fiber.take().map(Job::Fiber),
        };
        match (scheduler, job) {
            (Some(s), Some(j)) => Some((s, j)),
            _ => {
                warn!("event {} triggered with no live waiter", event);
                None
            }
        }
    }
}

/// Per-descriptor record of registered events and their waiters.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdContextInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(FdContextInner::default()),
        }
    }
}

/// Reactor state shared between the IoManager handle and its scheduler.
pub(crate) struct IoDriver {
    poller: Poller,
    tickle_r: RawFd,
    tickle_w: RawFd,
    /// Indexed by fd, grown by 1.5x on demand; entries live until drop.
    contexts: RwLock<Vec<Arc<FdContext>>>,
    pending: AtomicUsize,
    timers: TimerManager,
    sched: OnceLock<Weak<Scheduler>>,
    self_weak: Weak<IoDriver>,
}

impl IoDriver {
    fn create() -> SchedResult<Arc<IoDriver>> {
        let poller = Poller::new()?;

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(SchedError::PipeCreate(last_errno()));
        }
        let (tickle_r, tickle_w) = (fds[0], fds[1]);
        unsafe {
            let flags = libc::fcntl(tickle_r, libc::F_GETFL, 0);
            libc::fcntl(tickle_r, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let driver = Arc::new_cyclic(|weak: &Weak<IoDriver>| {
            let wk = weak.clone();
            IoDriver {
                poller,
                tickle_r,
                tickle_w,
                contexts: RwLock::new(Vec::new()),
                pending: AtomicUsize::new(0),
                // A timer landing in front of every deadline must wake the
                // poller to shorten its sleep.
                timers: TimerManager::new(move || {
                    if let Some(d) = wk.upgrade() {
                        d.tickle();
                    }
                }),
                sched: OnceLock::new(),
                self_weak: weak.clone(),
            }
        });

        driver
            .poller
            .ctl(
                libc::EPOLL_CTL_ADD,
                tickle_r,
                (libc::EPOLLIN | libc::EPOLLET) as u32,
                TICKLE_TOKEN,
            )
            .map_err(SchedError::PollerCtl)?;

        driver.grow_contexts(32);
        Ok(driver)
    }

    fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.sched.get().and_then(Weak::upgrade)
    }

    fn grow_contexts(&self, size: usize) {
        let mut contexts = self.contexts.write().unwrap();
        while contexts.len() < size {
            let next_fd = contexts.len() as RawFd;
            contexts.push(Arc::new(FdContext::new(next_fd)));
        }
    }

    /// Context for `fd`, growing the table when `auto_create` is set.
    fn context_for(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        {
            let contexts = self.contexts.read().unwrap();
            if let Some(ctx) = contexts.get(fd as usize) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }
        self.grow_contexts((fd as usize * 3 / 2).max(fd as usize + 1));
        self.contexts.read().unwrap().get(fd as usize).cloned()
    }

    fn add_event(&self, fd: RawFd, event: Event, cb: Option<FiberFn>) -> SchedResult<()> {
        assert!(event == Event::READ || event == Event::WRITE, "add_event: invalid event {}", event);
        let ctx = self
            .context_for(fd, true)
            .ok_or(SchedError::PollerCtl(libc::EBADF))?;
        let mut inner = ctx.inner.lock().unwrap();

        // One registration per direction; a duplicate means two waiters
        // would race for one wakeup.
        assert!(
            !inner.events.contains(event),
            "add_event: {} already registered on fd {}",
            event,
            fd
        );

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let bits = libc::EPOLLET as u32 | (inner.events | event).bits();
        if let Err(errno) = self.poller.ctl(op, fd, bits, Arc::as_ptr(&ctx) as u64) {
            error!(
                "epoll_ctl({}, {}, {}) failed: errno {} (events={})",
                op_name(op),
                fd,
                event,
                errno,
                inner.events
            );
            return Err(SchedError::PollerCtl(errno));
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.events |= event;

        let sched = tls::current_scheduler().or_else(|| self.scheduler());
        let ectx = inner.event_ctx(event);
        debug_assert!(ectx.is_empty());
        ectx.scheduler = sched.as_ref().map(Arc::downgrade);
        match cb {
            Some(cb) => ectx.cb = Some(cb),
            None => {
                let cur = Fiber::current();
                assert_eq!(
                    cur.state(),
                    FiberState::Running,
                    "add_event waiter fiber must be running"
                );
                ectx.fiber = Some(cur);
            }
        }
        Ok(())
    }

    fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context_for(fd, false) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events - event;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let bits = libc::EPOLLET as u32 | left.bits();
        if let Err(errno) = self.poller.ctl(op, fd, bits, Arc::as_ptr(&ctx) as u64) {
            error!("epoll_ctl({}, {}, {}) failed: errno {}", op_name(op), fd, event, errno);
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.events = left;
        *inner.event_ctx(event) = EventCtx::default();
        true
    }

    fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context_for(fd, false) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events - event;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let bits = libc::EPOLLET as u32 | left.bits();
        if let Err(errno) = self.poller.ctl(op, fd, bits, Arc::as_ptr(&ctx) as u64) {
            error!("epoll_ctl({}, {}, {}) failed: errno {}", op_name(op), fd, event, errno);
            return false;
        }

        let waiter = inner.take_triggered(event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        drop(inner);
        if let Some((sched, job)) = waiter {
            sched.enqueue(job, None);
        }
        true
    }

    fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.context_for(fd, false) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.is_empty() {
            return false;
        }

        if let Err(errno) = self
            .poller
            .ctl(libc::EPOLL_CTL_DEL, fd, 0, Arc::as_ptr(&ctx) as u64)
        {
            error!("epoll_ctl(EPOLL_CTL_DEL, {}) failed: errno {}", fd, errno);
            return false;
        }

        let registered = inner.events;
        let mut waiters = Vec::with_capacity(registered.count());
        for dir in [Event::READ, Event::WRITE] {
            if registered.contains(dir) {
                if let Some(w) = inner.take_triggered(dir) {
                    waiters.push(w);
                }
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        debug_assert!(inner.events.is_empty());
        drop(inner);
        for (sched, job) in waiters {
            sched.enqueue(job, None);
        }
        true
    }
}

impl SchedulerDriver for IoDriver {
    /// Wake a worker sleeping in the poller. Skipped when nobody is idle:
    /// busy workers re-check the queue on their own.
    fn tickle(&self) {
        debug!("tickle");
        let Some(sched) = self.scheduler() else {
            return;
        };
        if !sched.has_idle_threads() {
            return;
        }
        let rt = unsafe { libc::write(self.tickle_w, b"T".as_ptr() as *const libc::c_void, 1) };
        debug_assert_eq!(rt, 1);
    }

    fn extra_stopping(&self) -> bool {
        self.timers.next_timer_ms() == u64::MAX && self.pending.load(Ordering::SeqCst) == 0
    }

    fn on_thread_start(&self, _sched: &Arc<Scheduler>) {
        tls::set_current_io_driver(self.self_weak.clone());
    }

    fn idle(&self, sched: &Arc<Scheduler>) {
        debug!("io idle");
        const MAX_EVENTS: usize = 256;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut expired: Vec<TimerFn> = Vec::new();

        loop {
            let next_timeout = self.timers.next_timer_ms();
            if next_timeout == u64::MAX
                && self.pending.load(Ordering::SeqCst) == 0
                && sched.base_stopping()
            {
                debug!("name={} idle stopping exit", sched.name());
                break;
            }

            let timeout = next_timeout.min(MAX_TIMEOUT_MS) as i32;
            let n = loop {
                match self.poller.wait(&mut events, timeout) {
                    Ok(n) => break n,
                    Err(errno) if errno == libc::EINTR => continue,
                    Err(errno) => {
                        error!("epoll_wait failed: errno {}", errno);
                        break 0;
                    }
                }
            };

            // Expired timers first: their callbacks are due now.
            self.timers.list_expired(&mut expired);
            for cb in expired.drain(..) {
                sched.schedule(move || cb());
            }

            for ev in &events[..n] {
                if ev.u64 == TICKLE_TOKEN {
                    // Edge-triggered: drain every pending byte.
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(self.tickle_r, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    } > 0
                    {}
                    continue;
                }

                // Safety: tokens are pointers into the context table, which
                // only grows and lives as long as this driver.
                let ctx = unsafe { &*(ev.u64 as *const FdContext) };
                let mut inner = ctx.inner.lock().unwrap();

                let mut revents = ev.events;
                // On error/hangup fire both registered directions, or the
                // waiters would never run.
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
                }
                let real = Event::from_bits(revents) & inner.events;
                if real.is_empty() {
                    continue;
                }

                // Reprogram with the directions not firing this round.
                let left = inner.events - real;
                let op = if left.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                let bits = libc::EPOLLET as u32 | left.bits();
                if let Err(errno) = self.poller.ctl(op, ctx.fd, bits, ev.u64) {
                    error!(
                        "epoll_ctl({}, {}, {}) failed: errno {}",
                        op_name(op),
                        ctx.fd,
                        left,
                        errno
                    );
                    continue;
                }

                let mut waiters = Vec::with_capacity(real.count());
                for dir in [Event::READ, Event::WRITE] {
                    if real.contains(dir) {
                        if let Some(w) = inner.take_triggered(dir) {
                            waiters.push(w);
                        }
                        self.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                drop(inner);
                for (s, job) in waiters {
                    s.enqueue(job, None);
                }
            }

            // Hand control back so the dispatch loop runs what was just
            // scheduled; the scheduler resumes idle when the queue drains.
            yield_now();
        }
    }
}

impl Drop for IoDriver {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.tickle_r);
            libc::close(self.tickle_w);
        }
    }
}

/// Fiber scheduler with an integrated I/O reactor and timers.
///
/// Cheap to clone; all clones share one runtime. Call
/// [`stop`](IoManager::stop) to drain and join the workers.
#[derive(Clone)]
pub struct IoManager {
    sched: Arc<Scheduler>,
    driver: Arc<IoDriver>,
}

impl IoManager {
    /// Build and start an I/O scheduler.
    ///
    /// `threads` counts the caller thread when `use_caller` is set.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> SchedResult<IoManager> {
        let driver = IoDriver::create()?;
        let sched = Scheduler::with_driver(threads, use_caller, name, driver.clone());
        let _ = driver.sched.set(Arc::downgrade(&sched));
        if use_caller {
            tls::set_current_io_driver(driver.self_weak.clone());
        }

        let iom = IoManager { sched, driver };
        iom.sched.start();
        Ok(iom)
    }

    /// The IoManager driving the calling thread, if any.
    pub fn current() -> Option<IoManager> {
        let driver = tls::current_io_driver()?;
        let sched = driver.scheduler()?;
        Some(IoManager { sched, driver })
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Register one-shot interest in `event` on `fd` with the currently
    /// running fiber as the waiter; it is rescheduled when the event fires.
    ///
    /// Registering a direction twice is a programming error.
    pub fn add_event(&self, fd: RawFd, event: Event) -> SchedResult<()> {
        self.driver.add_event(fd, event, None)
    }

    /// Register one-shot interest in `event` on `fd` with a callback to
    /// schedule when it fires.
    pub fn add_event_cb(
        &self,
        fd: RawFd,
        event: Event,
        cb: impl FnOnce() + Send + 'static,
    ) -> SchedResult<()> {
        self.driver.add_event(fd, event, Some(Box::new(cb)))
    }

    /// Drop a registration without waking its waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.driver.del_event(fd, event)
    }

    /// Drop a registration, waking its waiter exactly once.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.driver.cancel_event(fd, event)
    }

    /// Drop every registration on `fd`, waking each waiter exactly once.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.driver.cancel_all(fd)
    }

    /// Number of registered, un-fired event directions.
    pub fn pending_event_count(&self) -> usize {
        self.driver.pending.load(Ordering::SeqCst)
    }

    /// Arm a timer firing in `ms` milliseconds.
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.driver.timers.add_timer(ms, cb, recurring)
    }

    /// Arm a timer gated on `witness` still being alive when it fires.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.driver.timers.add_condition_timer(ms, cb, witness, recurring)
    }

    /// Milliseconds until the next deadline, or `u64::MAX` with no timers.
    pub fn next_timer_ms(&self) -> u64 {
        self.driver.timers.next_timer_ms()
    }

    /// Whether any timer is armed.
    pub fn has_timer(&self) -> bool {
        self.driver.timers.has_timer()
    }

    /// Drain remaining work and join the workers.
    pub fn stop(&self) {
        self.sched.stop();
    }
}

impl std::ops::Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}
