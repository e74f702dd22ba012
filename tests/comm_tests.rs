//! Messaging end-to-end: delivery counts, payloads, ordering, and barrier
//! semantics on a two-core job.

use std::sync::atomic::{AtomicUsize, Ordering};

use myriad::Config;

fn init_logs() {
    let _ = tracing_subscriber::fmt::try_init();
}

#[test]
fn test_ping() {
    init_logs();
    static RECEIVED: AtomicUsize = AtomicUsize::new(0);
    const COUNT: usize = 4_194_304;

    let stats = myriad::run(Config::with_cores(2), || {
        for _ in 0..COUNT {
            myriad::send_immediate(1, || {
                RECEIVED.fetch_add(1, Ordering::Relaxed);
            });
        }
        myriad::on_all_cores(|| myriad::barrier());
        // Every send-immediate issued before the barrier has run on core 1.
        assert_eq!(RECEIVED.load(Ordering::Relaxed), COUNT);
    })
    .unwrap();
    assert!(stats.messages_delivered() >= COUNT as u64);
}

#[test]
fn test_payload() {
    init_logs();
    static STORED: AtomicUsize = AtomicUsize::new(0);
    let value: u32 = 12_345_678;

    myriad::run(Config::with_cores(2), move || {
        myriad::send_immediate_with_payload(
            1,
            |bytes| {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                STORED.store(u32::from_le_bytes(raw) as usize, Ordering::SeqCst);
            },
            &value.to_le_bytes(),
        );
        myriad::on_all_cores(|| myriad::barrier());
        assert_eq!(STORED.load(Ordering::SeqCst), 12_345_678);
    })
    .unwrap();
}

#[test]
fn test_fifo_from_single_sender() {
    init_logs();
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    static IN_ORDER: AtomicUsize = AtomicUsize::new(1);
    const COUNT: usize = 10_000;

    myriad::run(Config::with_cores(2), || {
        for i in 0..COUNT {
            myriad::send_immediate(1, move || {
                if NEXT.fetch_add(1, Ordering::SeqCst) != i {
                    IN_ORDER.store(0, Ordering::SeqCst);
                }
            });
        }
        myriad::on_all_cores(|| myriad::barrier());
        assert_eq!(NEXT.load(Ordering::SeqCst), COUNT);
        assert_eq!(IN_ORDER.load(Ordering::SeqCst), 1, "delivery left FIFO order");
    })
    .unwrap();
}

#[test]
fn test_double_barrier_equivalent_to_one() {
    init_logs();
    static HITS: AtomicUsize = AtomicUsize::new(0);

    myriad::run(Config::with_cores(2), || {
        myriad::send_immediate(1, || {
            HITS.fetch_add(1, Ordering::SeqCst);
        });
        myriad::on_all_cores(|| {
            myriad::barrier();
            myriad::barrier();
        });
        assert_eq!(HITS.load(Ordering::SeqCst), 1);

        // Messaging still behaves after back-to-back barriers.
        myriad::send_immediate(1, || {
            HITS.fetch_add(1, Ordering::SeqCst);
        });
        myriad::on_all_cores(|| myriad::barrier());
        assert_eq!(HITS.load(Ordering::SeqCst), 2);
    })
    .unwrap();
}

#[test]
fn test_self_send_delivers() {
    init_logs();
    static HITS: AtomicUsize = AtomicUsize::new(0);

    myriad::run(Config::with_cores(2), || {
        for _ in 0..100 {
            myriad::send_immediate(0, || {
                HITS.fetch_add(1, Ordering::SeqCst);
            });
        }
        myriad::on_all_cores(|| myriad::barrier());
        assert_eq!(HITS.load(Ordering::SeqCst), 100);
    })
    .unwrap();
}
