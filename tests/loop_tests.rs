//! Loop frontend end-to-end: execute-everywhere, fixed and balancing
//! decomposition, nested public spawns, and the asynchronous local loop.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use myriad::{Config, GlobalCompletionEvent};

const SLOTS: usize = 8;

#[test]
fn test_on_all_cores_sets_flag_everywhere() {
    static FLAG: [AtomicBool; SLOTS] = [const { AtomicBool::new(false) }; SLOTS];

    myriad::run(Config::with_cores(3), || {
        myriad::on_all_cores(|| {
            FLAG[myriad::my_core()].store(true, Ordering::SeqCst);
        });
        for c in 0..myriad::cores() {
            assert!(FLAG[c].load(Ordering::SeqCst), "core {c} never ran the body");
        }
    })
    .unwrap();
}

#[test]
fn test_forall_fixed_shares_match_block_distribution() {
    static COUNT: [AtomicI64; SLOTS] = [const { AtomicI64::new(0) }; SLOTS];
    const N: i64 = 256;

    let stats = myriad::run(Config::with_cores(4), || {
        myriad::forall(0, N, |_, iters| {
            COUNT[myriad::my_core()].fetch_add(iters, Ordering::SeqCst);
        });
        let mut total = 0;
        for c in 0..myriad::cores() {
            let r = myriad::block_dist(0, N, c, myriad::cores());
            assert_eq!(
                COUNT[c].load(Ordering::SeqCst),
                r.end - r.start,
                "core {c} ran a different share than its block"
            );
            total += COUNT[c].load(Ordering::SeqCst);
        }
        assert_eq!(total, N);
    })
    .unwrap();
    assert_eq!(stats.tasks_spawned(), stats.tasks_executed());
}

#[test]
fn test_forall_balancing_total() {
    static COUNT: [AtomicI64; SLOTS] = [const { AtomicI64::new(0) }; SLOTS];
    const N: i64 = 256;

    let stats = myriad::run(Config::with_cores(4), || {
        myriad::forall_balanced(0, N, |_, iters| {
            COUNT[myriad::my_core()].fetch_add(iters, Ordering::SeqCst);
        });
        // Placement is load-driven; only the total is deterministic.
        let total: i64 = (0..myriad::cores())
            .map(|c| COUNT[c].load(Ordering::SeqCst))
            .sum();
        assert_eq!(total, N);
    })
    .unwrap();
    assert_eq!(stats.tasks_spawned(), stats.tasks_executed());
}

#[test]
fn test_forall_balancing_nested_public_spawns() {
    static COUNT: [AtomicI64; SLOTS] = [const { AtomicI64::new(0) }; SLOTS];
    const N: i64 = 256;

    let stats = myriad::run(Config::with_cores(4), || {
        let gce = GlobalCompletionEvent::with_slot(1);
        myriad::forall_balanced_with(gce, 0, N, move |_, iters| {
            for _ in 0..iters {
                myriad::spawn_public_with(gce, || {
                    COUNT[myriad::my_core()].fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        let total: i64 = (0..myriad::cores())
            .map(|c| COUNT[c].load(Ordering::SeqCst))
            .sum();
        assert_eq!(total, N);
    })
    .unwrap();
    assert_eq!(stats.tasks_spawned(), stats.tasks_executed());
}

#[test]
fn test_forall_here_counts_locally() {
    myriad::run(Config::with_cores(2), || {
        let x = std::cell::Cell::new(0i64);
        myriad::forall_here(0, 15, |_, iters| {
            assert_eq!(myriad::my_core(), 0);
            x.set(x.get() + iters);
        });
        assert_eq!(x.get(), 15);
    })
    .unwrap();
}

#[test]
fn test_forall_empty_ranges_run_zero_times() {
    static RAN: AtomicBool = AtomicBool::new(false);

    myriad::run(Config::with_cores(2), || {
        myriad::forall(10, 10, |_, _| RAN.store(true, Ordering::SeqCst));
        myriad::forall(10, 3, |_, _| RAN.store(true, Ordering::SeqCst));
        myriad::forall_balanced(0, 0, |_, _| RAN.store(true, Ordering::SeqCst));
        myriad::forall_here(5, 5, |_, _| RAN.store(true, Ordering::SeqCst));
        assert!(!RAN.load(Ordering::SeqCst));
    })
    .unwrap();
}

#[test]
fn test_forall_here_async_fills_array() {
    const N: usize = 1_117_376;
    const X: u8 = 4;

    myriad::run(Config::with_cores(2), || {
        let mut y = vec![0u8; N];
        let addr = y.as_mut_ptr() as usize;
        let gce = GlobalCompletionEvent::with_slot(2);
        myriad::forall_here_async(gce, 0, N as i64, move |start, iters| {
            // SAFETY: disjoint subranges of the array, all on this core; the
            // vector outlives the wait below.
            unsafe {
                std::ptr::write_bytes((addr as *mut u8).add(start as usize), X, iters as usize);
            }
        });
        gce.wait();
        assert!(y.iter().all(|&b| b == X));
    })
    .unwrap();
}
