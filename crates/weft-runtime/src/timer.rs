//! Deadline-ordered timers
//!
//! An ordered set of timers keyed by `(absolute deadline, insertion seq)`.
//! The manager has no thread of its own: its owner asks for
//! [`next_timer_ms`](TimerManager::next_timer_ms) to bound a poller sleep
//! and drains [`list_expired`](TimerManager::list_expired) afterwards. A
//! timer inserted in front of everything else fires the manager's waker so
//! a sleeping poller can pick up the earlier deadline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::warn;

/// Timer callbacks may fire repeatedly (recurring timers), so they are
/// shared `Fn`s rather than one-shot closures.
pub type TimerFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Clock jump-back beyond this is treated as a rollback (1 h).
const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

/// Milliseconds on the monotonic clock.
pub(crate) fn now_ms() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Ordering key: deadline first, insertion seq as the stable tie-breaker.
type TimerKey = (u64, u64);

struct TimerShared {
    seq: u64,
    recurring: bool,
    /// Both only mutated under the manager's write lock.
    deadline_ms: AtomicU64,
    period_ms: AtomicU64,
    /// None once cancelled or fired (non-recurring).
    cb: Mutex<Option<TimerFn>>,
}

impl TimerShared {
    fn key(&self) -> TimerKey {
        (self.deadline_ms.load(Ordering::Relaxed), self.seq)
    }
}

struct TimerCore {
    timers: RwLock<BTreeMap<TimerKey, Arc<TimerShared>>>,
    /// Debounces front-insertion wakeups until the next `next_timer_ms`.
    tickled: AtomicBool,
    /// For monotonic-rollback detection.
    previous_ms: AtomicU64,
    seq: AtomicU64,
    waker: Box<dyn Fn() + Send + Sync>,
}

/// Handle to one live timer.
#[derive(Clone)]
pub struct Timer {
    core: Weak<TimerCore>,
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Cancel the timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let mut timers = core.timers.write().unwrap();
        let had_cb = self.shared.cb.lock().unwrap().take().is_some();
        if had_cb {
            timers.remove(&self.shared.key());
            true
        } else {
            false
        }
    }

    /// Push the deadline out to now + period.
    pub fn refresh(&self) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let mut timers = core.timers.write().unwrap();
        if self.shared.cb.lock().unwrap().is_none() {
            return false;
        }
        if timers.remove(&self.shared.key()).is_none() {
            return false;
        }
        let deadline = now_ms() + self.shared.period_ms.load(Ordering::Relaxed);
        self.shared.deadline_ms.store(deadline, Ordering::Relaxed);
        timers.insert(self.shared.key(), self.shared.clone());
        true
    }

    /// Change the period to `ms`.
    ///
    /// With `from_now` the new deadline counts from the current instant;
    /// otherwise the original phase is preserved (`old start + new period`).
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.shared.period_ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let mut timers = core.timers.write().unwrap();
        if self.shared.cb.lock().unwrap().is_none() {
            return false;
        }
        if timers.remove(&self.shared.key()).is_none() {
            return false;
        }
        let start = if from_now {
            now_ms()
        } else {
            self.shared.deadline_ms.load(Ordering::Relaxed)
                - self.shared.period_ms.load(Ordering::Relaxed)
        };
        self.shared.period_ms.store(ms, Ordering::Relaxed);
        self.shared.deadline_ms.store(start + ms, Ordering::Relaxed);
        timers.insert(self.shared.key(), self.shared.clone());
        true
    }
}

/// Ordered set of live timers.
pub struct TimerManager {
    core: Arc<TimerCore>,
}

impl TimerManager {
    /// `waker` runs (outside the lock) whenever a new timer lands in front
    /// of every existing deadline.
    pub fn new(waker: impl Fn() + Send + Sync + 'static) -> TimerManager {
        TimerManager {
            core: Arc::new(TimerCore {
                timers: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                previous_ms: AtomicU64::new(now_ms()),
                seq: AtomicU64::new(0),
                waker: Box::new(waker),
            }),
        }
    }

    /// Arm a timer firing in `ms` milliseconds.
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.add_timer_fn(ms, Arc::new(cb), recurring)
    }

    fn add_timer_fn(&self, ms: u64, cb: TimerFn, recurring: bool) -> Timer {
        let core = &self.core;
        let shared = Arc::new(TimerShared {
            seq: core.seq.fetch_add(1, Ordering::Relaxed),
            recurring,
            deadline_ms: AtomicU64::new(now_ms() + ms),
            period_ms: AtomicU64::new(ms),
            cb: Mutex::new(Some(cb)),
        });

        let at_front = {
            let mut timers = core.timers.write().unwrap();
            let key = shared.key();
            timers.insert(key, shared.clone());
            let front = timers.keys().next() == Some(&key) && !core.tickled.load(Ordering::Relaxed);
            if front {
                core.tickled.store(true, Ordering::Relaxed);
            }
            front
        };
        // Lock released first: the waker may re-enter the manager.
        if at_front {
            (core.waker)();
        }

        Timer {
            core: Arc::downgrade(core),
            shared,
        }
    }

    /// Arm a timer whose callback only runs while `witness` is still alive.
    ///
    /// Lets callers express "fire only while X still exists" without racing
    /// an explicit cancel against the guarded operation.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.add_timer(
            ms,
            move || {
                if witness.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline, 0 if overdue, or
    /// `u64::MAX` when no timer is armed. Clears the wakeup debounce.
    pub fn next_timer_ms(&self) -> u64 {
        let timers = self.core.timers.read().unwrap();
        self.core.tickled.store(false, Ordering::Relaxed);
        match timers.keys().next() {
            None => u64::MAX,
            Some(&(deadline, _)) => deadline.saturating_sub(now_ms()),
        }
    }

    /// Whether any timer is armed.
    pub fn has_timer(&self) -> bool {
        !self.core.timers.read().unwrap().is_empty()
    }

    /// Collect the callbacks of every expired timer into `cbs`.
    ///
    /// Recurring timers are re-armed at now + period; one-shot timers are
    /// detached from their handles. If the monotonic clock jumped back by
    /// more than an hour, the whole set is treated as expired.
    pub fn list_expired(&self, cbs: &mut Vec<TimerFn>) {
        let now = now_ms();

        // Read-side pass first: the idle loop polls this on every tick and
        // almost always finds nothing due. The write lock is taken only
        // once something actually has to be swept.
        let rollover;
        {
            let timers = self.core.timers.read().unwrap();
            if timers.is_empty() {
                return;
            }
            rollover = self.detect_clock_rollover(now);
            if !rollover && timers.keys().next().is_some_and(|&(d, _)| d > now) {
                return;
            }
        }
        if rollover {
            warn!("monotonic clock rollback detected, expiring all timers");
        }

        let mut timers = self.core.timers.write().unwrap();
        // The set may have changed between the locks.
        if timers.is_empty() {
            return;
        }
        if !rollover && timers.keys().next().is_some_and(|&(d, _)| d > now) {
            return;
        }

        let remaining = if rollover {
            BTreeMap::new()
        } else {
            timers.split_off(&(now + 1, 0))
        };
        let expired = std::mem::replace(&mut *timers, remaining);

        cbs.reserve(expired.len());
        for shared in expired.into_values() {
            let cb = shared.cb.lock().unwrap().clone();
            // A concurrent cancel may have emptied the slot already.
            let Some(cb) = cb else { continue };
            cbs.push(cb);
            if shared.recurring {
                shared
                    .deadline_ms
                    .store(now + shared.period_ms.load(Ordering::Relaxed), Ordering::Relaxed);
                timers.insert(shared.key(), shared.clone());
            } else {
                *shared.cb.lock().unwrap() = None;
            }
        }
    }

    fn detect_clock_rollover(&self, now: u64) -> bool {
        let previous = self.core.previous_ms.swap(now, Ordering::Relaxed);
        now < previous && now < previous.saturating_sub(ROLLOVER_THRESHOLD_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> TimerManager {
        TimerManager::new(|| {})
    }

    #[test]
    fn test_next_timer_sentinel_when_empty() {
        let m = manager();
        assert_eq!(m.next_timer_ms(), u64::MAX);
        assert!(!m.has_timer());
    }

    #[test]
    fn test_expired_in_deadline_order() {
        let m = manager();
        let order = Arc::new(Mutex::new(Vec::new()));
        for ms in [30u64, 10, 20] {
            let order = order.clone();
            m.add_timer(ms, move || order.lock().unwrap().push(ms), false);
        }

        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut cbs = Vec::new();
        m.list_expired(&mut cbs);
        assert_eq!(cbs.len(), 3);
        for cb in &cbs {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
        assert!(!m.has_timer());
    }

    #[test]
    fn test_past_deadline_expires_immediately() {
        let m = manager();
        m.add_timer(0, || {}, false);
        let mut cbs = Vec::new();
        m.list_expired(&mut cbs);
        assert_eq!(cbs.len(), 1);
    }

    #[test]
    fn test_cancel_detaches() {
        let m = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let t = m.add_timer(0, move || { f.fetch_add(1, Ordering::SeqCst); }, false);

        assert!(t.cancel());
        assert!(!t.cancel());
        assert!(!m.has_timer());

        let mut cbs = Vec::new();
        m.list_expired(&mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recurring_rearms() {
        let m = manager();
        let t = m.add_timer(0, || {}, true);

        let mut cbs = Vec::new();
        m.list_expired(&mut cbs);
        assert_eq!(cbs.len(), 1);
        assert!(m.has_timer());

        assert!(t.cancel());
        assert!(!m.has_timer());
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        let m = manager();
        let t = m.add_timer(5, || {}, false);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(t.refresh());

        let mut cbs = Vec::new();
        m.list_expired(&mut cbs);
        assert!(cbs.is_empty(), "refreshed timer must not be expired yet");
    }

    #[test]
    fn test_reset_from_now() {
        let m = manager();
        let t = m.add_timer(5, || {}, false);
        assert!(t.reset(60_000, true));
        std::thread::sleep(std::time::Duration::from_millis(10));

        let mut cbs = Vec::new();
        m.list_expired(&mut cbs);
        assert!(cbs.is_empty());
        assert!(m.next_timer_ms() > 50_000);
    }

    #[test]
    fn test_reset_preserves_phase() {
        let m = manager();
        let t = m.add_timer(60_000, || {}, false);
        // Same start instant, shorter period: deadline moves up accordingly.
        assert!(t.reset(10_000, false));
        let next = m.next_timer_ms();
        assert!(next <= 10_000, "next = {}", next);
    }

    #[test]
    fn test_condition_timer_skips_dead_witness() {
        let m = manager();
        let fired = Arc::new(AtomicUsize::new(0));

        let witness = Arc::new(());
        let f = fired.clone();
        m.add_condition_timer(0, move || { f.fetch_add(1, Ordering::SeqCst); }, Arc::downgrade(&witness), false);
        drop(witness);

        let mut cbs = Vec::new();
        m.list_expired(&mut cbs);
        for cb in &cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_front_insertion_fires_waker_once() {
        let woken = Arc::new(AtomicUsize::new(0));
        let w = woken.clone();
        let m = TimerManager::new(move || { w.fetch_add(1, Ordering::SeqCst); });

        m.add_timer(1000, || {}, false);
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        // Earlier deadline, but the debounce is still set.
        m.add_timer(10, || {}, false);
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        // next_timer_ms clears the debounce; a new front insert wakes again.
        let _ = m.next_timer_ms();
        m.add_timer(1, || {}, false);
        assert_eq!(woken.load(Ordering::SeqCst), 2);
    }
}
