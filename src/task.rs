//! Task manager: public and private work queues, message-based work
//! stealing, and the distributed termination protocol.
//!
//! Tasks are small copyable descriptors (a function pointer and three
//! machine words); a free worker pulls one and runs it to completion. Each
//! core owns both of its deques outright: thieves never touch a victim's
//! memory, they send a steal-request closure and receive the batch back as a
//! payload message, the way everything else crosses cores.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::rc::Rc;

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::completion::CompletionEvent;
use crate::gce::GlobalCompletionEvent;
use crate::metrics::Metrics;
use crate::runtime::{self, CoreState};
use crate::scheduler::WaitList;
use crate::transport::{Core, Ctrl};

pub(crate) type TaskFn = fn(usize, usize, usize);

/// A unit of work: entry point plus three argument words. Copyable so a
/// steal can move a batch between cores as plain bytes.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct Task {
    f: TaskFn,
    args: [usize; 3],
}

impl Task {
    pub(crate) fn new(f: TaskFn, a0: usize, a1: usize, a2: usize) -> Self {
        Task { f, args: [a0, a1, a2] }
    }

    pub(crate) fn run(self) {
        (self.f)(self.args[0], self.args[1], self.args[2]);
    }

    /// Wrap a sendable closure; the box pointer rides in the first argument
    /// word. Used for public tasks, which may execute on any core of the
    /// shared address space.
    pub(crate) fn from_closure<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let g: TaskFn = call_boxed::<F>;
        Task::new(g, Box::into_raw(Box::new(f)) as usize, 0, 0)
    }

    /// Wrap a core-local closure; private tasks never migrate, so `Send` is
    /// not required.
    pub(crate) fn from_local_closure<F>(f: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        let g: TaskFn = call_boxed_local::<F>;
        Task::new(g, Box::into_raw(Box::new(f)) as usize, 0, 0)
    }
}

fn call_boxed<F: FnOnce() + Send + 'static>(p: usize, _a1: usize, _a2: usize) {
    // SAFETY: p came from Box::into_raw in from_closure; a task is owned by
    // exactly one queue cell, so the box is reclaimed exactly once.
    let f = unsafe { Box::from_raw(p as *mut F) };
    f();
}

fn call_boxed_local<F: FnOnce() + 'static>(p: usize, _a1: usize, _a2: usize) {
    // SAFETY: as above.
    let f = unsafe { Box::from_raw(p as *mut F) };
    f();
}

fn tasks_as_bytes(tasks: &[Task]) -> Vec<u8> {
    // SAFETY: Task is repr(C) plain data (a code address and three words).
    unsafe {
        std::slice::from_raw_parts(tasks.as_ptr() as *const u8, mem::size_of_val(tasks)).to_vec()
    }
}

fn tasks_from_bytes(bytes: &[u8]) -> Vec<Task> {
    let n = bytes.len() / mem::size_of::<Task>();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        // SAFETY: the payload was produced by tasks_as_bytes in this binary.
        let t = unsafe {
            std::ptr::read_unaligned(bytes.as_ptr().add(i * mem::size_of::<Task>()) as *const Task)
        };
        out.push(t);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QState {
    Active,
    Quiescent,
}

pub(crate) struct TaskManager {
    /// Only the owner pushes and pops; continuations stay hot.
    private_q: RefCell<VecDeque<Task>>,
    /// Owner works the back; steal requests drain the front.
    public_q: RefCell<VecDeque<Task>>,
    /// Executors with nothing to do park here.
    parked: WaitList,
    executors_idle: Cell<usize>,
    executor_total: Cell<usize>,
    neighbors: Vec<Core>,
    steal_batch: usize,
    steal_retries: usize,
    /// At most one steal may be outstanding per thief core.
    steal_inflight: Cell<bool>,
    steal_ce: CompletionEvent,
    terminated: Cell<bool>,
    tasks_done: Cell<bool>,
    done_waiters: WaitList,
    state: Cell<QState>,
    // Collector tally (rank 0 only).
    quiet: RefCell<Vec<bool>>,
    probe_round: Cell<u64>,
    probe_acks: Cell<usize>,
    round_dirty: Cell<bool>,
    probing: Cell<bool>,
    /// Set while this core owes a phase-2 ack; paid once the inbox has been
    /// observed empty by the poll loop.
    pending_drain_ack: Cell<Option<u64>>,
    metrics: Rc<Metrics>,
}

impl TaskManager {
    pub(crate) fn new(
        cores: usize,
        neighbors: Vec<Core>,
        steal_batch: usize,
        steal_retries: usize,
        metrics: Rc<Metrics>,
    ) -> Self {
        TaskManager {
            private_q: RefCell::new(VecDeque::new()),
            public_q: RefCell::new(VecDeque::new()),
            parked: WaitList::new(),
            executors_idle: Cell::new(0),
            executor_total: Cell::new(0),
            neighbors,
            steal_batch,
            steal_retries,
            steal_inflight: Cell::new(false),
            steal_ce: CompletionEvent::new(),
            terminated: Cell::new(false),
            tasks_done: Cell::new(false),
            done_waiters: WaitList::new(),
            state: Cell::new(QState::Active),
            quiet: RefCell::new(vec![false; cores]),
            probe_round: Cell::new(0),
            probe_acks: Cell::new(0),
            round_dirty: Cell::new(false),
            probing: Cell::new(false),
            pending_drain_ack: Cell::new(None),
            metrics,
        }
    }

    pub(crate) fn set_executors(&self, n: usize) {
        self.executor_total.set(n);
    }

    pub(crate) fn enqueue_private(&self, t: Task) {
        Metrics::bump(&self.metrics.tasks_spawned_private);
        self.private_q.borrow_mut().push_back(t);
    }

    pub(crate) fn enqueue_public(&self, t: Task) {
        Metrics::bump(&self.metrics.tasks_spawned_public);
        self.public_q.borrow_mut().push_back(t);
    }

    pub(crate) fn spawn_private(&self, core: &CoreState, t: Task) {
        self.enqueue_private(t);
        self.notify_work_arrived(core);
    }

    pub(crate) fn spawn_public(&self, core: &CoreState, t: Task) {
        self.enqueue_public(t);
        self.notify_work_arrived(core);
    }

    /// Private tail first: freshly enqueued continuations beat older public
    /// work for locality.
    pub(crate) fn try_acquire(&self) -> Option<Task> {
        if let Some(t) = self.private_q.borrow_mut().pop_back() {
            return Some(t);
        }
        self.public_q.borrow_mut().pop_back()
    }

    fn queues_empty(&self) -> bool {
        self.private_q.borrow().is_empty() && self.public_q.borrow().is_empty()
    }

    fn is_idle(&self) -> bool {
        self.terminated.get()
            && self.queues_empty()
            && !self.steal_inflight.get()
            && self.executors_idle.get() == self.executor_total.get()
    }

    fn notify_work_arrived(&self, core: &CoreState) {
        if self.state.get() == QState::Quiescent {
            self.state.set(QState::Active);
            core.comm.send_ctrl(0, Ctrl::Awake { core: core.core });
        }
        self.parked.wake_one(&core.sched);
    }

    /// Entry of every task-executor worker.
    pub(crate) fn executor_loop() {
        let core = runtime::core();
        while let Some(task) = core.tasks.get_work(&core) {
            Metrics::bump(&core.metrics.tasks_executed);
            task.run();
        }
        trace!(core = core.core, "task executor exiting");
    }

    fn get_work(&self, core: &CoreState) -> Option<Task> {
        loop {
            if self.tasks_done.get() {
                return None;
            }
            if let Some(t) = self.try_acquire() {
                return Some(t);
            }
            if self.terminated.get() {
                self.park_quiescent(core);
                continue;
            }
            if !self.steal_inflight.get() && !self.neighbors.is_empty() && self.steal_round(core) {
                continue;
            }
            // Out of victims for now; park until work arrives or the poller
            // kicks off another round.
            self.park(core);
        }
    }

    /// One bounded round of stealing: victims in random order, suspending on
    /// the reply between attempts. True if any work landed.
    fn steal_round(&self, core: &CoreState) -> bool {
        let mut order = self.neighbors.clone();
        order.shuffle(&mut rand::thread_rng());
        for &victim in order.iter().take(self.steal_retries) {
            debug_assert!(!self.steal_inflight.get());
            self.steal_inflight.set(true);
            Metrics::bump(&self.metrics.steal_requests);
            self.steal_ce.enroll(1);
            let thief = core.core;
            let batch = self.steal_batch;
            core.comm.send_immediate(victim, move || {
                let c = runtime::core();
                TaskManager::handle_steal_request(&c, thief, batch);
            });
            self.steal_ce.wait();
            self.steal_inflight.set(false);
            if !self.queues_empty() {
                return true;
            }
            Metrics::bump(&self.metrics.steal_replies_empty);
            if self.terminated.get() || self.tasks_done.get() {
                break;
            }
        }
        false
    }

    /// Victim side: pop a bounded batch off the public front and ship it
    /// back. Replies even when empty so the thief can move on.
    pub(crate) fn handle_steal_request(core: &CoreState, thief: Core, max: usize) {
        let tasks: Vec<Task> = {
            let mut q = core.tasks.public_q.borrow_mut();
            let n = q.len().min(max);
            q.drain(..n).collect()
        };
        Metrics::add(&core.metrics.tasks_stolen_out, tasks.len() as u64);
        trace!(core = core.core, thief, stolen = tasks.len(), "steal request served");
        let bytes = tasks_as_bytes(&tasks);
        core.comm.send_immediate_with_payload(
            thief,
            move |payload| {
                let c = runtime::core();
                TaskManager::handle_steal_reply(&c, payload);
            },
            &bytes,
        );
    }

    /// Thief side: land the batch on the public deque and release the
    /// waiting thief worker.
    fn handle_steal_reply(core: &CoreState, payload: &[u8]) {
        let tasks = tasks_from_bytes(payload);
        if !tasks.is_empty() {
            Metrics::add(&core.metrics.tasks_stolen_in, tasks.len() as u64);
            {
                let mut q = core.tasks.public_q.borrow_mut();
                for t in tasks {
                    q.push_back(t);
                }
            }
            core.tasks.notify_work_arrived(core);
        }
        core.tasks.steal_ce.complete(1);
    }

    fn park(&self, core: &CoreState) {
        self.executors_idle.set(self.executors_idle.get() + 1);
        core.sched.block_on(&self.parked);
        self.executors_idle.set(self.executors_idle.get() - 1);
    }

    /// Park after the termination signal; the last executor to drain sends
    /// the quiescent notice.
    fn park_quiescent(&self, core: &CoreState) {
        self.executors_idle.set(self.executors_idle.get() + 1);
        if self.is_idle() && self.state.get() == QState::Active {
            self.state.set(QState::Quiescent);
            debug!(core = core.core, "core quiescent");
            core.comm.send_ctrl(0, Ctrl::Quiescent { core: core.core });
        }
        core.sched.block_on(&self.parked);
        self.executors_idle.set(self.executors_idle.get() - 1);
    }

    /// Poller hook: wake one parked executor to retry stealing when the core
    /// sits idle with remote work possibly available.
    pub(crate) fn steal_kick(&self, core: &CoreState) {
        if !self.terminated.get()
            && !self.tasks_done.get()
            && self.executors_idle.get() > 0
            && self.queues_empty()
            && !self.steal_inflight.get()
            && !self.neighbors.is_empty()
        {
            self.parked.wake_one(&core.sched);
        }
    }

    /// Delivered to every core when the user main is done spawning.
    pub(crate) fn signal_termination(&self, core: &CoreState) {
        if self.terminated.replace(true) {
            return;
        }
        debug!(core = core.core, "termination signaled");
        self.parked.wake_all(&core.sched);
    }

    /// Block the caller until the terminate broadcast lands.
    pub(crate) fn wait_tasks_done(&self, core: &CoreState) {
        while !self.tasks_done.get() {
            core.sched.block_on(&self.done_waiters);
        }
    }

    pub(crate) fn handle_ctrl(core: &CoreState, ctrl: Ctrl) {
        let tm = &core.tasks;
        match ctrl {
            Ctrl::Quiescent { core: c } => {
                tm.quiet.borrow_mut()[c] = true;
                tm.maybe_start_probe(core);
            }
            Ctrl::Awake { core: c } => {
                tm.quiet.borrow_mut()[c] = false;
                tm.round_dirty.set(true);
            }
            Ctrl::TermProbe { round, phase } => {
                if phase == 1 {
                    // Phase 1: push everything buffered onto the wire, so
                    // phase 2 finds all in-flight work sitting in inboxes.
                    core.comm.flush_all();
                    core.comm.send_ctrl(
                        0,
                        Ctrl::TermAck {
                            core: core.core,
                            round,
                            phase: 1,
                            idle: tm.is_idle(),
                        },
                    );
                } else {
                    tm.pending_drain_ack.set(Some(round));
                }
            }
            Ctrl::TermAck { round, phase, idle, .. } => {
                debug_assert_eq!(core.core, 0);
                if round != tm.probe_round.get() {
                    return;
                }
                if !idle {
                    tm.round_dirty.set(true);
                }
                tm.probe_acks.set(tm.probe_acks.get() + 1);
                if tm.probe_acks.get() == core.cores {
                    tm.probe_acks.set(0);
                    if tm.round_dirty.get() {
                        // Someone woke during the round; re-arm and wait for
                        // a fresh quiescent wave.
                        tm.probing.set(false);
                        tm.maybe_start_probe(core);
                    } else if phase == 1 {
                        core.comm
                            .broadcast_ctrl(Ctrl::TermProbe { round, phase: 2 });
                    } else {
                        debug!("termination confirmed, broadcasting");
                        core.comm.broadcast_ctrl(Ctrl::TasksDone);
                    }
                }
            }
            Ctrl::TasksDone => {
                tm.tasks_done.set(true);
                tm.parked.wake_all(&core.sched);
                tm.done_waiters.wake_all(&core.sched);
                runtime::spawn_finalizer(core);
            }
            other => unreachable!("not a task-manager frame: {other:?}"),
        }
    }

    fn maybe_start_probe(&self, core: &CoreState) {
        if self.probing.get() || self.tasks_done.get() {
            return;
        }
        if self.quiet.borrow().iter().all(|q| *q) {
            self.probing.set(true);
            self.probe_round.set(self.probe_round.get() + 1);
            self.round_dirty.set(false);
            self.probe_acks.set(0);
            trace!(round = self.probe_round.get(), "starting termination probe");
            core.comm.broadcast_ctrl(Ctrl::TermProbe {
                round: self.probe_round.get(),
                phase: 1,
            });
        }
    }

    /// Pay a deferred phase-2 ack. Called by the poll loop at the moment the
    /// inbox has been observed empty.
    pub(crate) fn ack_drained_if_pending(&self, core: &CoreState) {
        if let Some(round) = self.pending_drain_ack.take() {
            core.comm.send_ctrl(
                0,
                Ctrl::TermAck {
                    core: core.core,
                    round,
                    phase: 2,
                    idle: self.is_idle(),
                },
            );
        }
    }
}

impl fmt::Display for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task manager: private {}, public {}, idle {}/{}, {} {:?}",
            self.private_q.borrow().len(),
            self.public_q.borrow().len(),
            self.executors_idle.get(),
            self.executor_total.get(),
            if self.terminated.get() { "terminated" } else { "active" },
            self.state.get(),
        )
    }
}

/// Spawn a task on the calling core's private deque; it will not be visible
/// to thieves.
pub fn spawn_private<F>(f: F)
where
    F: FnOnce() + 'static,
{
    let core = runtime::core();
    core.tasks.spawn_private(&core, Task::from_local_closure(f));
}

/// Spawn a stealable task on the calling core's public deque.
pub fn spawn_public<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let core = runtime::core();
    core.tasks.spawn_public(&core, Task::from_closure(f));
}

/// Spawn a stealable task whose completion is tracked by `gce`. The
/// enrollment stays on the spawning core; wherever the task runs, its
/// completion is routed home.
pub fn spawn_public_with<F>(gce: GlobalCompletionEvent, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let core = runtime::core();
    gce.enroll(1);
    let origin = core.core;
    let task = Task::from_closure(move || {
        f();
        let c = runtime::core();
        if c.core == origin {
            gce.complete(1);
        } else {
            c.comm.send_immediate(origin, move || {
                gce.complete(1);
            });
        }
    });
    core.tasks.spawn_public(&core, task);
}
