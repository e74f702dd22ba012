//! Task manager end-to-end: spawn accounting, stealing against empty and
//! loaded victims, and clean termination of idle jobs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use myriad::{Config, GlobalCompletionEvent};

const SLOTS: usize = 8;

#[test]
fn test_idle_job_terminates() {
    let stats = myriad::run(Config::with_cores(2), || {}).unwrap();
    assert_eq!(stats.tasks_spawned(), stats.tasks_executed());
}

#[test]
fn test_single_core_job() {
    static HITS: AtomicUsize = AtomicUsize::new(0);
    let stats = myriad::run(Config::with_cores(1), || {
        myriad::forall_here(0, 100, |_, iters| {
            HITS.fetch_add(iters as usize, Ordering::SeqCst);
        });
        assert_eq!(HITS.load(Ordering::SeqCst), 100);
    })
    .unwrap();
    assert_eq!(stats.tasks_spawned(), stats.tasks_executed());
}

#[test]
fn test_steals_of_empty_victims_come_back_empty() {
    // No public work ever exists, so every steal reply must be empty, and
    // the job still winds down without thieves busy-looping.
    let stats = myriad::run(Config::with_cores(2), || {
        for _ in 0..200 {
            myriad::yield_now();
        }
    })
    .unwrap();
    let requests: u64 = stats.per_core.iter().map(|m| m.steal_requests).sum();
    let empties: u64 = stats.per_core.iter().map(|m| m.steal_replies_empty).sum();
    assert_eq!(requests, empties);
    assert_eq!(stats.tasks_stolen(), 0);
}

#[test]
fn test_public_spawn_totals_and_accounting() {
    static DONE: [AtomicUsize; SLOTS] = [const { AtomicUsize::new(0) }; SLOTS];
    const K: usize = 2000;

    let stats = myriad::run(Config::with_cores(4), || {
        let gce = GlobalCompletionEvent::with_slot(1);
        gce.enroll(1);
        for _ in 0..K {
            myriad::spawn_public_with(gce, || {
                // Enough work per task that thieves have a window to engage.
                std::hint::black_box((0..64).fold(0usize, |a, b| a.wrapping_add(b)));
                DONE[myriad::my_core()].fetch_add(1, Ordering::SeqCst);
            });
        }
        gce.complete(1);
        gce.wait();
        let total: usize = (0..myriad::cores())
            .map(|c| DONE[c].load(Ordering::SeqCst))
            .sum();
        assert_eq!(total, K);
    })
    .unwrap();
    // Started equals finished once the job has drained.
    assert_eq!(stats.tasks_spawned(), stats.tasks_executed());
}

#[test]
fn test_spawn_private_stays_local() {
    static RAN_ON: AtomicUsize = AtomicUsize::new(usize::MAX);
    static DONE: AtomicBool = AtomicBool::new(false);

    myriad::run(Config::with_cores(2), || {
        myriad::spawn_private(|| {
            RAN_ON.store(myriad::my_core(), Ordering::SeqCst);
            DONE.store(true, Ordering::SeqCst);
        });
        while !DONE.load(Ordering::SeqCst) {
            myriad::yield_now();
        }
        assert_eq!(RAN_ON.load(Ordering::SeqCst), 0);
    })
    .unwrap();
}

#[test]
fn test_remote_spawn_after_message() {
    // A closure delivered to a remote core spawns work there; the tasks and
    // the termination protocol both see it.
    static HITS: AtomicUsize = AtomicUsize::new(0);

    let stats = myriad::run(Config::with_cores(2), || {
        let gce = GlobalCompletionEvent::with_slot(1);
        gce.enroll(1);
        myriad::send_immediate(1, move || {
            myriad::spawn_public_with(gce, || {
                HITS.fetch_add(1, Ordering::SeqCst);
            });
            myriad::send_immediate(0, move || gce.complete(1));
        });
        gce.wait();
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    })
    .unwrap();
    assert_eq!(stats.tasks_spawned(), stats.tasks_executed());
}
