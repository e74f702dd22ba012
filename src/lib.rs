//! # Myriad: a runtime for irregular, latency-sensitive parallelism
//!
//! Myriad scales irregular computations across a set of *cores* (one kernel
//! thread each, grouped into memory-sharing *locales*) under a partitioned
//! global address space discipline. Application code expresses parallelism
//! as lightweight tasks that migrate to the data they touch; the runtime
//! multiplexes tens of thousands of cooperative user-level workers per core,
//! hides per-message latency by aggregating small typed closures into bulk
//! transfers, and balances load by message-based work stealing.
//!
//! ## Architecture
//!
//! - **Scheduler**: a single-threaded cooperative scheduler per core rotates
//!   ready workers, activates periodic workers (notably the polling worker)
//!   at a bounded rate, and parks when idle.
//! - **Task manager**: private (local) and public (stealable) deques,
//!   victim-selection work stealing over the message layer, and a two-phase
//!   distributed termination protocol.
//! - **Communicator & aggregator**: typed serialized closures batched per
//!   destination and flushed as bulk transfers, with exactly-once delivery
//!   and per-sender FIFO; collective barriers drain everything in flight.
//! - **Loop frontend**: recursive range decomposition in fixed and
//!   balancing flavors over local and global completion events.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! static SUM: AtomicUsize = AtomicUsize::new(0);
//!
//! let cfg = myriad::Config::with_cores(4);
//! myriad::run(cfg, || {
//!     myriad::forall(0, 1 << 20, |_, iters| {
//!         SUM.fetch_add(iters as usize, Ordering::Relaxed);
//!     });
//!     assert_eq!(SUM.load(Ordering::Relaxed), 1 << 20);
//! })
//! .unwrap();
//! ```

mod aggregator;
mod communicator;
mod completion;
mod config;
mod error;
mod gce;
mod loops;
mod memory;
mod message;
mod metrics;
mod runtime;
mod scheduler;
mod semaphore;
mod signal;
mod task;
mod transport;
mod worker;

pub use completion::CompletionEvent;
pub use config::{Config, ENV_FREEZE, ENV_FREEZE_ON_ERROR, ENV_LOCAL_RANK};
pub use error::Error;
pub use gce::GlobalCompletionEvent;
pub use loops::{block_dist, forall, forall_balanced, forall_balanced_with, forall_here,
                forall_here_async, on_all_cores};
pub use metrics::{MetricsSnapshot, RunStats};
pub use runtime::{run, Runtime};
pub use task::{spawn_private, spawn_public, spawn_public_with};

/// This core's dense index within the job.
pub fn my_core() -> usize {
    runtime::core().core
}

/// Total cores in the job.
pub fn cores() -> usize {
    runtime::core().cores
}

/// This core's locale.
pub fn my_locale() -> usize {
    runtime::core().locale
}

/// Total locales in the job.
pub fn locales() -> usize {
    runtime::core().locales
}

/// Cores per locale.
pub fn locale_cores() -> usize {
    runtime::core().locale_cores
}

/// This core's rank within its locale.
pub fn my_locale_rank() -> usize {
    runtime::core().locale_rank
}

/// Collective barrier: returns only after every core has entered it and all
/// previously issued messages have been delivered. Every core must call it,
/// e.g. from inside [`on_all_cores`].
pub fn barrier() {
    let core = runtime::core();
    core.comm.barrier(&core);
}

/// Enqueue `f` for exactly-once execution on core `dst`. Delivery is FIFO
/// with respect to other sends from this core to `dst` and completes no
/// later than the next collective barrier.
pub fn send_immediate<F>(dst: usize, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let core = runtime::core();
    core.comm.send_immediate(dst, f);
}

/// As [`send_immediate`], with an opaque payload reassembled at the
/// destination and handed to the closure.
pub fn send_immediate_with_payload<F>(dst: usize, f: F, payload: &[u8])
where
    F: FnOnce(&[u8]) + Send + 'static,
{
    let core = runtime::core();
    core.comm.send_immediate_with_payload(dst, f, payload);
}

/// Cooperatively yield the calling worker.
pub fn yield_now() {
    runtime::core().sched.yield_now();
}
