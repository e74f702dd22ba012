//! Global completion events: distributed join barriers.
//!
//! Every core holds a local counter for each event slot; the slots are
//! symmetric, so a copyable handle names "the same" event everywhere. Cores
//! report their local zero/nonzero transitions to the collector at rank 0,
//! which broadcasts a release once every core is locally complete. A core
//! that re-arms after reporting zero sends an active notice first, so the
//! collector can never conclude completion while work is still moving
//! (notices bypass the aggregator and the fabric preserves their causal
//! order into the collector's inbox).

use std::cell::{Cell, RefCell};

use crate::runtime::{self, CoreState};
use crate::scheduler::WaitList;
use crate::transport::{Core, Ctrl};

/// Loop frontends track their outstanding spawns on this reserved slot.
pub(crate) const LOOP_GCE: usize = 0;

/// Per-core state for one event slot.
pub(crate) struct GceState {
    id: usize,
    count: Cell<i64>,
    /// Set by enroll, cleared by release; `wait` returns only when the slot
    /// is disarmed with a zero count.
    armed: Cell<bool>,
    waiters: WaitList,
    /// Collector state, used on rank 0 only: which cores currently report a
    /// nonzero count.
    active: RefCell<Vec<bool>>,
}

impl GceState {
    pub(crate) fn new(id: usize, cores: usize) -> Self {
        GceState {
            id,
            count: Cell::new(0),
            armed: Cell::new(false),
            waiters: WaitList::new(),
            active: RefCell::new(vec![false; cores]),
        }
    }
}

/// Cheap copyable handle on a symmetric event slot.
///
/// The number of slots is set by [`Config::gce_slots`](crate::Config);
/// slot 0 is reserved for the loop frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalCompletionEvent {
    id: usize,
}

impl GlobalCompletionEvent {
    /// Handle on slot `id`. The slot index is validated when the handle is
    /// first used on a core.
    pub const fn with_slot(id: usize) -> Self {
        GlobalCompletionEvent { id }
    }

    /// Register `n` pending completions on the calling core.
    pub fn enroll(&self, n: i64) {
        debug_assert!(n > 0);
        let core = runtime::core();
        let st = self.state(&core);
        let was = st.count.get();
        st.count.set(was + n);
        st.armed.set(true);
        if was == 0 {
            core.comm
                .send_ctrl(0, Ctrl::GceActive { id: st.id, core: core.core });
        }
    }

    /// Retire `n` completions on the calling core; the transition to local
    /// zero notifies the collector.
    pub fn complete(&self, n: i64) {
        let core = runtime::core();
        let st = self.state(&core);
        let now = st.count.get() - n;
        debug_assert!(now >= 0, "global completion event over-completed");
        st.count.set(now);
        if now == 0 {
            core.comm
                .send_ctrl(0, Ctrl::GceZero { id: st.id, core: core.core });
        }
    }

    /// Park the calling worker until the cluster-wide release for the
    /// current phase. Returns immediately when the slot is disarmed.
    pub fn wait(&self) {
        let core = runtime::core();
        let st = self.state(&core);
        while st.armed.get() || st.count.get() > 0 {
            core.sched.block_on(&st.waiters);
        }
    }

    /// Local outstanding count, mainly for diagnostics.
    pub fn count(&self) -> i64 {
        let core = runtime::core();
        self.state(&core).count.get()
    }

    fn state<'a>(&self, core: &'a CoreState) -> &'a GceState {
        core.gces
            .get(self.id)
            .unwrap_or_else(|| panic!("global completion event slot {} out of range", self.id))
    }
}

/// Collector: a core left zero.
pub(crate) fn handle_active(core: &CoreState, id: usize, from: Core) {
    debug_assert_eq!(core.core, 0);
    core.gces[id].active.borrow_mut()[from] = true;
}

/// Collector: a core reached zero; release everyone once all are.
pub(crate) fn handle_zero(core: &CoreState, id: usize, from: Core) {
    debug_assert_eq!(core.core, 0);
    let all_zero = {
        let mut active = core.gces[id].active.borrow_mut();
        active[from] = false;
        active.iter().all(|a| !*a)
    };
    if all_zero {
        core.comm.broadcast_ctrl(Ctrl::GceRelease { id });
    }
}

/// Release: disarm and wake waiters on a locally complete core. A core that
/// already re-armed for a new phase ignores the stale release.
pub(crate) fn handle_release(core: &CoreState, id: usize) {
    let st = &core.gces[id];
    if st.count.get() == 0 && st.armed.get() {
        st.armed.set(false);
        st.waiters.wake_all(&core.sched);
    }
}
