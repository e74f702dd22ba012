//! Worker contexts: suspendable user-level execution backed by `corosensei`.
//!
//! A worker is a stackful coroutine plus the bookkeeping the scheduler needs:
//! its slab id, its state, and the yielder pointer that lets runtime code
//! suspend the worker from arbitrary call depth. Slots use interior
//! mutability throughout because a suspended coroutine holds a pointer to its
//! own slot.

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::{Cell, RefCell};

/// Slab key identifying a worker on its core.
pub(crate) type WorkerId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Fresh,
    Ready,
    Running,
    Blocked,
    Done,
}

/// Why a worker handed control back to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Switch {
    /// Ordinary yield; requeue at the ready tail.
    Ready,
    /// Periodic worker finished a round; park until its next activation.
    Periodic,
    /// The worker parked itself on some wait list; it owns no queue slot
    /// until an unblock.
    Blocked,
}

/// Input for a resume. The first resume carries a pointer to the worker's own
/// slot so the coroutine can register its yielder before running the entry.
pub(crate) enum Run {
    Start(SlotPtr),
    Resume,
}

/// Raw pointer wrapper for the slot handoff into the coroutine.
#[derive(Clone, Copy)]
pub(crate) struct SlotPtr(pub(crate) *const WorkerSlot);

type WorkerCoroutine = Coroutine<Run, Switch, (), DefaultStack>;

/// A worker's slab entry. Boxed by the scheduler so its address is stable
/// while the coroutine holds a pointer to it.
pub(crate) struct WorkerSlot {
    pub(crate) id: WorkerId,
    coro: RefCell<Option<WorkerCoroutine>>,
    /// Valid only while the coroutine is live; set on first resume.
    yielder: Cell<*const Yielder<Run, Switch>>,
    pub(crate) state: Cell<WorkerState>,
    /// Periodic workers park in the periodic list instead of the ready queue
    /// and are not recycled through the unassigned pool.
    pub(crate) periodic: Cell<bool>,
}

pub(crate) enum RunOutcome {
    Yielded(Switch),
    Completed,
}

impl WorkerSlot {
    pub(crate) fn new(id: WorkerId) -> Self {
        WorkerSlot {
            id,
            coro: RefCell::new(None),
            yielder: Cell::new(std::ptr::null()),
            state: Cell::new(WorkerState::Done),
            periodic: Cell::new(false),
        }
    }

    /// Arm the slot with a fresh coroutine running `entry`. Reuse recreates
    /// the coroutine, which also resets the stack.
    pub(crate) fn install(&self, entry: Box<dyn FnOnce()>, stack_size: usize) {
        let stack = DefaultStack::new(stack_size).expect("worker stack allocation failed");
        *self.coro.borrow_mut() = Some(Coroutine::with_stack(stack, move |yielder, input: Run| {
            if let Run::Start(slot) = input {
                // SAFETY: the slot is boxed and outlives its coroutine; the
                // master passed a pointer to this very slot.
                unsafe { (*slot.0).yielder.set(yielder as *const _) };
            }
            entry();
        }));
        self.yielder.set(std::ptr::null());
        self.state.set(WorkerState::Fresh);
    }

    /// Resume the worker. Must only be called by the master; the coroutine
    /// borrow is held across the switch, which is fine because nothing inside
    /// the worker touches its own coroutine cell.
    pub(crate) fn resume(&self) -> RunOutcome {
        let input = match self.state.get() {
            WorkerState::Fresh => Run::Start(SlotPtr(self as *const WorkerSlot)),
            _ => Run::Resume,
        };
        self.state.set(WorkerState::Running);
        let mut coro = self.coro.borrow_mut();
        match coro.as_mut().expect("resume of retired worker").resume(input) {
            CoroutineResult::Yield(why) => RunOutcome::Yielded(why),
            CoroutineResult::Return(()) => {
                *coro = None;
                self.state.set(WorkerState::Done);
                RunOutcome::Completed
            }
        }
    }

    /// Suspend the currently running worker (i.e. this one) back to the
    /// master with the given reason.
    pub(crate) fn suspend(&self, why: Switch) {
        let yielder = self.yielder.get();
        assert!(!yielder.is_null(), "suspend before first resume");
        // SAFETY: the yielder pointer is valid for the lifetime of the live
        // coroutine, and suspend is only reachable from inside it.
        unsafe { (*yielder).suspend(why) };
    }
}

thread_local! {
    /// The worker currently executing on this core, if any. Runtime code
    /// outside any worker (the master loop, delivery handlers running on the
    /// master) sees `None` and must not suspend.
    static CURRENT: Cell<Option<CurrentWorker>> = const { Cell::new(None) };
}

#[derive(Clone, Copy)]
pub(crate) struct CurrentWorker {
    pub(crate) id: WorkerId,
    pub(crate) slot: *const WorkerSlot,
}

pub(crate) fn current() -> Option<CurrentWorker> {
    CURRENT.get()
}

pub(crate) fn set_current(w: Option<CurrentWorker>) {
    CURRENT.set(w);
}

/// Whether the caller is executing inside a worker (and may therefore block).
pub(crate) fn in_worker() -> bool {
    CURRENT.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_run_to_completion() {
        let hits = Rc::new(Cell::new(0));
        let slot = Box::new(WorkerSlot::new(0));
        let h = Rc::clone(&hits);
        slot.install(Box::new(move || h.set(h.get() + 1)), 64 * 1024);
        assert_eq!(slot.state.get(), WorkerState::Fresh);
        assert!(matches!(slot.resume(), RunOutcome::Completed));
        assert_eq!(hits.get(), 1);
        assert_eq!(slot.state.get(), WorkerState::Done);
    }

    #[test]
    fn test_yield_and_resume() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let slot = Box::new(WorkerSlot::new(0));
        let slot_ptr = &*slot as *const WorkerSlot;
        let t = Rc::clone(&trace);
        slot.install(
            Box::new(move || {
                t.borrow_mut().push("a");
                // SAFETY: test drives the same boxed slot it points at.
                unsafe { (*slot_ptr).suspend(Switch::Ready) };
                t.borrow_mut().push("b");
            }),
            64 * 1024,
        );
        assert!(matches!(slot.resume(), RunOutcome::Yielded(Switch::Ready)));
        assert_eq!(*trace.borrow(), vec!["a"]);
        assert!(matches!(slot.resume(), RunOutcome::Completed));
        assert_eq!(*trace.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_reinstall_reuses_slot() {
        let slot = Box::new(WorkerSlot::new(3));
        let first = Rc::new(Cell::new(false));
        let f = Rc::clone(&first);
        slot.install(Box::new(move || f.set(true)), 64 * 1024);
        assert!(matches!(slot.resume(), RunOutcome::Completed));
        let second = Rc::new(Cell::new(false));
        let s = Rc::clone(&second);
        slot.install(Box::new(move || s.set(true)), 64 * 1024);
        assert!(matches!(slot.resume(), RunOutcome::Completed));
        assert!(first.get() && second.get());
    }
}
