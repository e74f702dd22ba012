//! Parallel-loop frontend: recursive range decomposition over the task
//! manager, in fixed (pinned) and balancing (stealable) flavors, plus the
//! execute-everywhere collective.
//!
//! Decomposition bisects the index range until a leaf is at or under the
//! configured threshold, spawning the upper half as a task at each step.
//! Fixed loops spawn private tasks and join on a local completion event;
//! balancing loops spawn public tasks tracked by a global completion event,
//! so halves can migrate to idle cores mid-loop.

use std::cell::Cell;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::completion::CompletionEvent;
use crate::gce::{GlobalCompletionEvent, LOOP_GCE};
use crate::runtime;
use crate::task::{self, Task};

/// The contiguous block of `[lo, hi)` owned by `id` of `n` cores.
pub fn block_dist(lo: i64, hi: i64, id: usize, n: usize) -> Range<i64> {
    let total = hi - lo;
    if total <= 0 || n == 0 {
        return hi..hi;
    }
    let each = (total + n as i64 - 1) / n as i64;
    let start = lo + each * id as i64;
    if start >= hi {
        return hi..hi;
    }
    start..(start + each).min(hi)
}

// ---------------------------------------------------------------------------
// Fixed, local: private tasks joined on a stack-held completion event.

struct PrivateCtx {
    call: unsafe fn(*const (), i64, i64),
    body: *const (),
    ce: *const CompletionEvent,
    threshold: i64,
}

unsafe fn call_leaf<F: Fn(i64, i64)>(body: *const (), start: i64, iters: i64) {
    // SAFETY: body points at the F borrowed by the loop entry, which waits
    // for every leaf before returning.
    unsafe { (*(body as *const F))(start, iters) };
}

fn private_step(ctx_addr: usize, start: usize, iters: usize) {
    // SAFETY: the ctx outlives all tasks spawned from it; see forall_here.
    let ctx = unsafe { &*(ctx_addr as *const PrivateCtx) };
    let core = runtime::core();
    let start = start as i64;
    let mut iters = iters as i64;
    while iters > ctx.threshold {
        let rest = iters / 2;
        let mid = start + (iters - rest);
        core.tasks
            .spawn_private(&core, Task::new(private_task, ctx_addr, mid as usize, rest as usize));
        iters -= rest;
    }
    // Leaf: run the body for the remaining subrange.
    unsafe {
        (ctx.call)(ctx.body, start, iters);
        (*ctx.ce).complete(iters);
    }
}

fn private_task(ctx: usize, start: usize, iters: usize) {
    private_step(ctx, start, iters);
}

/// Run `body(start, iters)` over `[lo, hi)` on the calling core, blocking
/// until every iteration has run. `hi <= lo` invokes the body zero times.
pub fn forall_here<F>(lo: i64, hi: i64, body: F)
where
    F: Fn(i64, i64),
{
    let iters = hi - lo;
    if iters <= 0 {
        return;
    }
    let core = runtime::core();
    let ce = CompletionEvent::new();
    ce.enroll(iters);
    let ctx = PrivateCtx {
        call: call_leaf::<F>,
        body: &body as *const F as *const (),
        ce: &ce as *const CompletionEvent,
        threshold: core.loop_threshold,
    };
    drop(core);
    private_step(&ctx as *const PrivateCtx as usize, lo as usize, iters as usize);
    ce.wait();
}

// ---------------------------------------------------------------------------
// Fixed, local, asynchronous: the context owns the body and frees itself
// when the last task retires; the caller joins on the supplied event.

struct AsyncCtx<F> {
    body: F,
    gce: GlobalCompletionEvent,
    threshold: i64,
    refs: Cell<usize>,
}

fn async_step<F: Fn(i64, i64) + 'static>(ctx_addr: usize, start: usize, iters: usize) {
    // SAFETY: the refcount keeps the box alive until the last task retires.
    let ctx = unsafe { &*(ctx_addr as *const AsyncCtx<F>) };
    let core = runtime::core();
    let start = start as i64;
    let mut iters = iters as i64;
    while iters > ctx.threshold {
        let rest = iters / 2;
        let mid = start + (iters - rest);
        ctx.refs.set(ctx.refs.get() + 1);
        core.tasks
            .spawn_private(&core, Task::new(async_task::<F>, ctx_addr, mid as usize, rest as usize));
        iters -= rest;
    }
    drop(core);
    (ctx.body)(start, iters);
    ctx.gce.complete(iters);
    if ctx.refs.get() == 1 {
        // SAFETY: last reference; no task points here anymore.
        drop(unsafe { Box::from_raw(ctx_addr as *mut AsyncCtx<F>) });
    } else {
        ctx.refs.set(ctx.refs.get() - 1);
    }
}

fn async_task<F: Fn(i64, i64) + 'static>(ctx: usize, start: usize, iters: usize) {
    async_step::<F>(ctx, start, iters);
}

/// Asynchronous [`forall_here`]: enrolls `hi - lo` on `gce` and returns as
/// soon as decomposition is seeded. The caller is responsible for
/// `gce.wait()`.
pub fn forall_here_async<F>(gce: GlobalCompletionEvent, lo: i64, hi: i64, body: F)
where
    F: Fn(i64, i64) + 'static,
{
    let iters = hi - lo;
    if iters <= 0 {
        return;
    }
    let threshold = runtime::core().loop_threshold;
    gce.enroll(iters);
    let ctx = Box::into_raw(Box::new(AsyncCtx {
        body,
        gce,
        threshold,
        refs: Cell::new(1),
    }));
    async_step::<F>(ctx as usize, lo as usize, iters as usize);
}

// ---------------------------------------------------------------------------
// Balancing: halves are public tasks, free to migrate; joined on a global
// completion event with completions routed back to each spawn's core.

struct BalancedCtx<F> {
    body: F,
    gce: GlobalCompletionEvent,
    threshold: i64,
    refs: AtomicUsize,
}

fn balanced_step<F: Fn(i64, i64) + Send + Sync + 'static>(
    ctx_addr: usize,
    start: i64,
    mut iters: i64,
) {
    // SAFETY: the refcount keeps the box alive until the last task, on
    // whatever core it ran, has released it.
    let ctx = unsafe { &*(ctx_addr as *const BalancedCtx<F>) };
    while iters > ctx.threshold {
        let rest = iters / 2;
        let mid = start + (iters - rest);
        ctx.refs.fetch_add(1, Ordering::Relaxed);
        task::spawn_public_with(ctx.gce, move || {
            balanced_step::<F>(ctx_addr, mid, rest);
            balanced_release::<F>(ctx_addr);
        });
        iters -= rest;
    }
    (ctx.body)(start, iters);
}

fn balanced_release<F>(ctx_addr: usize) {
    // SAFETY: each holder releases exactly once.
    let ctx = unsafe { &*(ctx_addr as *const BalancedCtx<F>) };
    if ctx.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
        drop(unsafe { Box::from_raw(ctx_addr as *mut BalancedCtx<F>) });
    }
}

/// Balancing loop over `[lo, hi)` joined on `gce`: recursive halves are
/// stealable public tasks, so placement is load-driven and nondeterministic.
/// Blocks until the whole loop (and everything else enrolled on `gce`,
/// nested spawns included) has completed cluster-wide.
pub fn forall_balanced_with<F>(gce: GlobalCompletionEvent, lo: i64, hi: i64, body: F)
where
    F: Fn(i64, i64) + Send + Sync + 'static,
{
    let iters = hi - lo;
    if iters <= 0 {
        return;
    }
    let threshold = runtime::core().loop_threshold;
    // Root token: holds the event up until decomposition is fully seeded.
    gce.enroll(1);
    let ctx = Box::into_raw(Box::new(BalancedCtx {
        body,
        gce,
        threshold,
        refs: AtomicUsize::new(1),
    }));
    balanced_step::<F>(ctx as usize, lo, iters);
    balanced_release::<F>(ctx as usize);
    gce.complete(1);
    gce.wait();
}

/// [`forall_balanced_with`] on the loop frontend's reserved event slot.
pub fn forall_balanced<F>(lo: i64, hi: i64, body: F)
where
    F: Fn(i64, i64) + Send + Sync + 'static,
{
    forall_balanced_with(GlobalCompletionEvent::with_slot(LOOP_GCE), lo, hi, body)
}

// ---------------------------------------------------------------------------
// Global fixed loop and the execute-everywhere collective.

/// Run `body(start, iters)` over `[lo, hi)` with the range block-distributed
/// across all cores: one task per core carries its subrange, then each core
/// decomposes locally. Work is pinned at decomposition time.
pub fn forall<F>(lo: i64, hi: i64, body: F)
where
    F: Fn(i64, i64) + Clone + Send + 'static,
{
    if hi <= lo {
        return;
    }
    on_all_cores(move || {
        let (me, n) = {
            let c = runtime::core();
            (c.core, c.cores)
        };
        let r = block_dist(lo, hi, me, n);
        if r.start < r.end {
            forall_here(r.start, r.end, |s, i| body(s, i));
        }
    });
}

/// Run `f` once on every core (the caller's included), blocking until all
/// have finished. `f` runs as a private task, so it may block and spawn.
pub fn on_all_cores<F>(f: F)
where
    F: Fn() + Clone + Send + 'static,
{
    let core = runtime::core();
    let n = core.cores;
    let ce = CompletionEvent::new();
    ce.enroll(n as i64);
    let ce_addr = &ce as *const CompletionEvent as usize;
    let home = core.core;
    for dst in 0..n {
        let g = f.clone();
        core.comm.send_immediate(dst, move || {
            task::spawn_private(move || {
                g();
                let c = runtime::core();
                c.comm.send_immediate(home, move || {
                    // SAFETY: the caller waits on the event before its frame
                    // unwinds, and completions arrive before the wait ends.
                    unsafe { (*(ce_addr as *const CompletionEvent)).complete(1) };
                });
            });
        });
    }
    drop(core);
    ce.wait();
}
