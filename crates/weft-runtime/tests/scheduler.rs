//! Scheduler behavior: dispatch, thread targeting, caller participation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_runtime::scheduler::{current_thread_id, Scheduler};
use weft_runtime::fiber::{yield_now, Fiber};

#[test]
fn hundred_callbacks_all_run_once() {
    let sched = Scheduler::new(2, false, "s1");
    sched.start();

    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
        let log = log.clone();
        sched.schedule(move || log.lock().unwrap().push(i));
    }

    sched.stop();

    let mut seen = log.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
    assert_eq!(sched.active_count(), 0);
}

#[test]
fn fibers_can_yield_and_finish() {
    let sched = Scheduler::new(2, false, "yielding");
    sched.start();

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let hits = hits.clone();
        let fiber = Fiber::new(
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
                // Yield is one-way: a fiber that wants to run again queues
                // itself first. Re-queuing while still RUNNING also
                // exercises the dispatch loop's skip of in-flight fibers.
                Scheduler::current()
                    .unwrap()
                    .schedule_fiber(Fiber::current());
                yield_now();
                hits.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        )
        .unwrap();
        sched.schedule_fiber(fiber);
    }

    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 20);
}

#[test]
fn targeted_tasks_run_on_their_thread_in_order() {
    let sched = Scheduler::new(2, false, "pinned");
    sched.start();

    // Workers register their tids on startup.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while sched.thread_ids().len() < 2 {
        assert!(std::time::Instant::now() < deadline, "workers never registered");
        std::thread::sleep(Duration::from_millis(5));
    }
    let target = sched.thread_ids()[0];

    let log: Arc<Mutex<Vec<(u64, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..20 {
        let log = log.clone();
        sched.schedule_on(
            move || log.lock().unwrap().push((current_thread_id(), i)),
            target,
        );
    }

    sched.stop();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 20);
    for (tid, _) in log.iter() {
        assert_eq!(*tid, target);
    }
    // Same-target tasks keep their enqueue order.
    let order: Vec<usize> = log.iter().map(|&(_, i)| i).collect();
    assert_eq!(order, (0..20).collect::<Vec<_>>());
}

#[test]
fn use_caller_drains_on_stop() {
    // threads=1 with use_caller: no extra workers at all, every task runs
    // on this thread inside stop().
    let sched = Scheduler::new(1, true, "caller-only");
    sched.start();

    let ran = Arc::new(AtomicUsize::new(0));
    let caller_tid = current_thread_id();
    let observed = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..5 {
        let ran = ran.clone();
        let observed = observed.clone();
        sched.schedule(move || {
            ran.fetch_add(1, Ordering::SeqCst);
            observed.lock().unwrap().push(current_thread_id());
        });
    }
    assert_eq!(ran.load(Ordering::SeqCst), 0, "nothing may run before stop");

    sched.stop();

    assert_eq!(ran.load(Ordering::SeqCst), 5);
    for tid in observed.lock().unwrap().iter() {
        assert_eq!(*tid, caller_tid);
    }
    assert_eq!(sched.active_count(), 0);
}

#[test]
fn tasks_scheduled_from_tasks_still_run() {
    let sched = Scheduler::new(2, false, "nested");
    sched.start();

    let hits = Arc::new(AtomicUsize::new(0));
    {
        let sched2 = sched.clone();
        let hits = hits.clone();
        sched.schedule(move || {
            for _ in 0..10 {
                let hits = hits.clone();
                sched2.schedule(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
    }

    // Let the nested tasks land before requesting the drain.
    std::thread::sleep(Duration::from_millis(100));
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 10);
}
