//! Single-threaded cooperative scheduler, one per core.
//!
//! The master loop owns worker selection: ready workers first, then the
//! periodic workers at a bounded rate, then a brief park on the fabric inbox
//! when there is nothing runnable. Workers are kept in a boxed slab keyed by
//! id; queues and wait lists hold ids only, so a worker appears in at most
//! one queue at a time.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::metrics::Metrics;
use crate::runtime::CoreState;
use crate::semaphore::ReusePool;
use crate::worker::{self, CurrentWorker, RunOutcome, Switch, WorkerId, WorkerSlot, WorkerState};

/// How long the master parks on the inbox when nothing is runnable.
const IDLE_PARK: Duration = Duration::from_micros(200);

/// A queue of blocked workers owned by some synchronization object. Whoever
/// holds a worker's id here owns the worker until it wakes.
pub(crate) struct WaitList {
    q: RefCell<VecDeque<WorkerId>>,
}

impl WaitList {
    pub(crate) fn new() -> Self {
        WaitList {
            q: RefCell::new(VecDeque::new()),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.q.borrow().is_empty()
    }

    fn push(&self, id: WorkerId) {
        self.q.borrow_mut().push_back(id);
    }

    /// Make one parked worker runnable. Never suspends.
    pub(crate) fn wake_one(&self, sched: &Scheduler) -> bool {
        let id = { self.q.borrow_mut().pop_front() };
        match id {
            Some(id) => {
                sched.unblock(id);
                true
            }
            None => false,
        }
    }

    /// Make every parked worker runnable. Never suspends.
    pub(crate) fn wake_all(&self, sched: &Scheduler) -> usize {
        let ids: Vec<WorkerId> = { self.q.borrow_mut().drain(..).collect() };
        let n = ids.len();
        for id in ids {
            sched.unblock(id);
        }
        n
    }
}

pub(crate) struct Scheduler {
    slots: RefCell<Vec<Option<Box<WorkerSlot>>>>,
    free: RefCell<Vec<WorkerId>>,
    ready: RefCell<VecDeque<WorkerId>>,
    /// Parked periodic workers (notably the poller).
    periodic: RefCell<Vec<WorkerId>>,
    resumes: Cell<u64>,
    periodic_last: Cell<u64>,
    periodic_interval: u64,
    /// Time bound on periodic activation, so age-based flushes still happen
    /// on a core with no runnable workers.
    periodic_last_at: Cell<Instant>,
    periodic_every: Duration,
    /// Retired workers eligible for re-entry.
    unassigned: ReusePool<WorkerId>,
    live: Cell<usize>,
    max_workers: usize,
    stack_size: usize,
    metrics: Rc<Metrics>,
}

impl Scheduler {
    pub(crate) fn new(
        periodic_interval: u64,
        periodic_every: Duration,
        pool_capacity: usize,
        max_workers: usize,
        stack_size: usize,
        metrics: Rc<Metrics>,
    ) -> Self {
        Scheduler {
            slots: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            ready: RefCell::new(VecDeque::new()),
            periodic: RefCell::new(Vec::new()),
            resumes: Cell::new(0),
            periodic_last: Cell::new(0),
            periodic_interval,
            periodic_last_at: Cell::new(Instant::now()),
            periodic_every,
            unassigned: ReusePool::new(pool_capacity),
            live: Cell::new(0),
            max_workers,
            stack_size,
            metrics,
        }
    }

    /// Spawn a worker running `entry` and enqueue it as ready. Never
    /// suspends unless the worker cap forces a wait for a retiring worker.
    pub(crate) fn spawn<F>(&self, entry: F) -> WorkerId
    where
        F: FnOnce() + 'static,
    {
        self.spawn_boxed(Box::new(entry), false)
    }

    /// Spawn a long-lived worker activated at the periodic rate rather than
    /// through the ready queue.
    pub(crate) fn spawn_periodic<F>(&self, entry: F) -> WorkerId
    where
        F: FnOnce() + 'static,
    {
        self.spawn_boxed(Box::new(entry), true)
    }

    fn spawn_boxed(&self, entry: Box<dyn FnOnce()>, periodic: bool) -> WorkerId {
        let id = self.acquire_slot();
        {
            let slots = self.slots.borrow();
            let slot = slots[id].as_ref().expect("acquired slot missing");
            slot.periodic.set(periodic);
            slot.install(entry, self.stack_size);
        }
        Metrics::bump(&self.metrics.worker_spawns);
        if periodic {
            self.periodic.borrow_mut().push(id);
        } else {
            self.ready.borrow_mut().push_back(id);
        }
        id
    }

    fn acquire_slot(&self) -> WorkerId {
        if let Some(id) = self.unassigned.try_pop() {
            return id;
        }
        if self.live.get() >= self.max_workers && worker::in_worker() {
            // At the cap: wait for some worker to retire into the pool.
            return self.unassigned.block_until_pop();
        }
        let mut slots = self.slots.borrow_mut();
        let id = match self.free.borrow_mut().pop() {
            Some(id) => {
                slots[id] = Some(Box::new(WorkerSlot::new(id)));
                id
            }
            None => {
                let id = slots.len();
                slots.push(Some(Box::new(WorkerSlot::new(id))));
                id
            }
        };
        self.live.set(self.live.get() + 1);
        id
    }

    /// Cooperatively relinquish the core; the caller is requeued at the
    /// ready tail.
    pub(crate) fn yield_now(&self) {
        let cur = worker::current().expect("yield outside worker");
        Metrics::bump(&self.metrics.yields);
        // SAFETY: the slot is boxed and live while its worker runs.
        unsafe { (*cur.slot).suspend(Switch::Ready) };
    }

    /// Yield from a periodic worker; the caller parks until its next
    /// rate-bounded activation.
    pub(crate) fn yield_periodic(&self) {
        let cur = worker::current().expect("yield outside worker");
        Metrics::bump(&self.metrics.yields);
        // SAFETY: as above.
        unsafe { (*cur.slot).suspend(Switch::Periodic) };
    }

    /// Park the current worker on `wl`; returns after some party wakes it.
    pub(crate) fn block_on(&self, wl: &WaitList) {
        let cur = worker::current().expect("block outside worker");
        Metrics::bump(&self.metrics.blocks);
        wl.push(cur.id);
        // SAFETY: as above.
        unsafe {
            (*cur.slot).state.set(WorkerState::Blocked);
            (*cur.slot).suspend(Switch::Blocked);
        }
    }

    /// Insert a blocked worker on the ready queue. Never suspends.
    pub(crate) fn unblock(&self, id: WorkerId) {
        {
            let slots = self.slots.borrow();
            let slot = slots[id].as_ref().expect("unblock of freed worker");
            debug_assert_eq!(slot.state.get(), WorkerState::Blocked);
            slot.state.set(WorkerState::Ready);
        }
        self.ready.borrow_mut().push_back(id);
    }

    fn periodic_due(&self) -> bool {
        self.resumes.get().wrapping_sub(self.periodic_last.get()) >= self.periodic_interval
            || self.periodic_last_at.get().elapsed() >= self.periodic_every
    }

    /// Activate every parked periodic worker once. Returns whether any ran.
    fn run_periodic(&self, core: &CoreState) -> bool {
        self.periodic_last.set(self.resumes.get());
        self.periodic_last_at.set(Instant::now());
        let ids: Vec<WorkerId> = { self.periodic.borrow_mut().drain(..).collect() };
        let any = !ids.is_empty();
        for id in ids {
            self.resume(core, id);
        }
        any
    }

    fn resume(&self, core: &CoreState, id: WorkerId) {
        let slot = { self.slots.borrow_mut()[id].take() }.expect("resume of missing worker");
        self.resumes.set(self.resumes.get() + 1);
        Metrics::bump(&self.metrics.resumes);
        worker::set_current(Some(CurrentWorker {
            id,
            slot: &*slot,
        }));
        let outcome = catch_unwind(AssertUnwindSafe(|| slot.resume()));
        worker::set_current(None);
        let periodic = slot.periodic.get();
        self.slots.borrow_mut()[id] = Some(slot);
        match outcome {
            Ok(RunOutcome::Yielded(Switch::Ready)) => {
                let slots = self.slots.borrow();
                slots[id].as_ref().expect("slot vanished").state.set(WorkerState::Ready);
                drop(slots);
                self.ready.borrow_mut().push_back(id);
            }
            Ok(RunOutcome::Yielded(Switch::Periodic)) => {
                self.periodic.borrow_mut().push(id);
            }
            Ok(RunOutcome::Yielded(Switch::Blocked)) => {
                // A wait list owns the worker now; block_on set the state.
            }
            Ok(RunOutcome::Completed) => {
                self.retire(id, periodic);
            }
            Err(payload) => {
                // Fail fast: re-raise on the core thread so the job dies
                // rather than hanging its collectives.
                error!(core = core.core, worker = id, "worker panicked");
                resume_unwind(payload);
            }
        }
    }

    fn retire(&self, id: WorkerId, periodic: bool) {
        if !periodic && self.unassigned.try_push(id) {
            return;
        }
        let mut slots = self.slots.borrow_mut();
        slots[id] = None;
        self.free.borrow_mut().push(id);
        self.live.set(self.live.get() - 1);
    }

    /// Master loop: rotate ready workers, activate periodic workers at the
    /// configured rate, and park briefly when there is nothing to run. Exits
    /// once the done flag is set and the ready queue has drained.
    pub(crate) fn run_master(&self, core: &CoreState) {
        trace!(core = core.core, "master loop entered");
        loop {
            if self.periodic_due() {
                self.run_periodic(core);
            }
            let next = { self.ready.borrow_mut().pop_front() };
            match next {
                Some(id) => self.resume(core, id),
                None => {
                    if core.done.get() {
                        break;
                    }
                    // Idle: give the periodic workers a turn if they are
                    // due, else park on the inbox until any async event
                    // arrives (the poll delivers inline, so unblocks still
                    // happen while parked).
                    if !self.periodic_due() || !self.run_periodic(core) {
                        core.comm.poll_blocking(core, IDLE_PARK);
                    }
                }
            }
        }
        // Let periodic workers observe the done flag and unwind, then run
        // stragglers they released.
        self.run_periodic(core);
        loop {
            let next = { self.ready.borrow_mut().pop_front() };
            match next {
                Some(id) => self.resume(core, id),
                None => break,
            }
        }
        trace!(core = core.core, "master loop exited");
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scheduler: ready {}, periodic {}, unassigned {}, live {}",
            self.ready.borrow().len(),
            self.periodic.borrow().len(),
            self.unassigned.count(),
            self.live.get(),
        )
    }
}
