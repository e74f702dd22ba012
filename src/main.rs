use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use myriad::Config;

static TOUCHED: AtomicUsize = AtomicUsize::new(0);
static SUM: AtomicUsize = AtomicUsize::new(0);

fn main() {
    let cores = 4;
    let cfg = Config::with_cores(cores);
    println!("myriad demo on {cores} cores\n");

    let stats = myriad::run(cfg, move || {
        // Example 1: run something once on every core.
        myriad::on_all_cores(|| {
            TOUCHED.fetch_add(1, Ordering::Relaxed);
        });
        println!("on_all_cores touched {} cores", TOUCHED.load(Ordering::Relaxed));

        // Example 2: a block-distributed loop.
        let n = 1 << 20;
        let start = Instant::now();
        myriad::forall(0, n, |_, iters| {
            SUM.fetch_add(iters as usize, Ordering::Relaxed);
        });
        println!(
            "forall(0, {n}) summed {} iterations in {:?}",
            SUM.load(Ordering::Relaxed),
            start.elapsed()
        );

        // Example 3: the same loop, load-balanced by stealing.
        SUM.store(0, Ordering::Relaxed);
        let start = Instant::now();
        myriad::forall_balanced(0, n, |_, iters| {
            SUM.fetch_add(iters as usize, Ordering::Relaxed);
        });
        println!(
            "forall_balanced(0, {n}) summed {} iterations in {:?}",
            SUM.load(Ordering::Relaxed),
            start.elapsed()
        );
    })
    .expect("job failed");

    println!(
        "\n{} tasks executed, {} stolen, {} messages delivered",
        stats.tasks_executed(),
        stats.tasks_stolen(),
        stats.messages_delivered()
    );
    for snap in &stats.per_core {
        println!("  {snap}");
    }
}
