//! Synchronization end-to-end: completion events under real scheduling,
//! global completion event phases, and init-time failure modes.

use std::sync::atomic::{AtomicUsize, Ordering};

use myriad::{CompletionEvent, Config, Error, GlobalCompletionEvent, Runtime};

#[test]
fn test_completion_event_joins_spawned_work() {
    myriad::run(Config::with_cores(1), || {
        let ce = CompletionEvent::new();
        ce.enroll(4);
        let addr = &ce as *const CompletionEvent as usize;
        for _ in 0..4 {
            myriad::spawn_private(move || {
                // SAFETY: the event outlives the wait below, and all
                // completions land before the wait returns.
                unsafe { (*(addr as *const CompletionEvent)).complete(1) };
            });
        }
        ce.wait();
        assert_eq!(ce.count(), 0);
        // A second wait on the drained event returns without suspending.
        ce.wait();
    })
    .unwrap();
}

#[test]
fn test_completion_event_interleaved_enrolls() {
    myriad::run(Config::with_cores(1), || {
        let ce = CompletionEvent::new();
        let addr = &ce as *const CompletionEvent as usize;
        ce.enroll(1);
        myriad::spawn_private(move || {
            let ce = unsafe { &*(addr as *const CompletionEvent) };
            // Enroll-before-complete within the child keeps the counter
            // from dipping to zero early.
            ce.enroll(2);
            myriad::spawn_private(move || {
                let ce = unsafe { &*(addr as *const CompletionEvent) };
                ce.complete(2);
            });
            ce.complete(1);
        });
        ce.wait();
        assert_eq!(ce.count(), 0);
    })
    .unwrap();
}

#[test]
fn test_gce_reenrollment_across_phases() {
    static PHASE_HITS: AtomicUsize = AtomicUsize::new(0);

    myriad::run(Config::with_cores(2), || {
        let gce = GlobalCompletionEvent::with_slot(1);
        for _ in 0..3 {
            gce.enroll(1);
            myriad::send_immediate(1, move || {
                PHASE_HITS.fetch_add(1, Ordering::SeqCst);
                myriad::send_immediate(0, move || gce.complete(1));
            });
            gce.wait();
            assert_eq!(gce.count(), 0);
        }
        assert_eq!(PHASE_HITS.load(Ordering::SeqCst), 3);
    })
    .unwrap();
}

#[test]
fn test_gce_wait_without_enrollment_returns() {
    myriad::run(Config::with_cores(2), || {
        let gce = GlobalCompletionEvent::with_slot(3);
        // Nothing enrolled anywhere: the slot is disarmed.
        gce.wait();
    })
    .unwrap();
}

#[test]
fn test_locale_identity() {
    myriad::run(Config::with_cores(4).cores_per_locale(2), || {
        assert_eq!(myriad::locales(), 2);
        assert_eq!(myriad::locale_cores(), 2);
        myriad::on_all_cores(|| {
            assert_eq!(myriad::my_locale(), myriad::my_core() / 2);
            assert_eq!(myriad::my_locale_rank(), myriad::my_core() % 2);
        });
    })
    .unwrap();
}

#[test]
fn test_invalid_config_is_rejected() {
    assert!(matches!(
        Runtime::new(Config::with_cores(0)),
        Err(Error::Config(_))
    ));
    let mut cfg = Config::with_cores(2);
    cfg.loop_threshold = 0;
    assert!(matches!(Runtime::new(cfg), Err(Error::Config(_))));
}

#[test]
fn test_impossible_footprint_fails_init() {
    let mut cfg = Config::with_cores(2);
    cfg.node_memsize = Some(1 << 20);
    assert!(matches!(
        Runtime::new(cfg),
        Err(Error::Footprint { .. })
    ));
}

#[test]
fn test_worker_panic_surfaces_at_join() {
    static TRIGGER: AtomicUsize = AtomicUsize::new(0);
    let result = myriad::run(Config::with_cores(1), || {
        TRIGGER.store(1, Ordering::SeqCst);
        panic!("application closure died");
    });
    assert!(matches!(result, Err(Error::WorkerPanic(_))));
    assert_eq!(TRIGGER.load(Ordering::SeqCst), 1);
}
