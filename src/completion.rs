//! Completion events: counting join barriers local to one core.

use std::cell::Cell;

use crate::scheduler::WaitList;

/// A signed counter with a wait queue. Enroll before the matching completes
/// can possibly race ahead (typically at loop entry, before spawning); the
/// counter is never observed negative once enrollments and completions match.
pub struct CompletionEvent {
    count: Cell<i64>,
    waiters: WaitList,
}

impl CompletionEvent {
    pub fn new() -> Self {
        CompletionEvent {
            count: Cell::new(0),
            waiters: WaitList::new(),
        }
    }

    /// Register `n` pending completions.
    pub fn enroll(&self, n: i64) {
        debug_assert!(n >= 0);
        self.count.set(self.count.get() + n);
    }

    /// Retire `n` completions; on the transition to zero every waiter is
    /// made runnable.
    pub fn complete(&self, n: i64) {
        let now = self.count.get() - n;
        debug_assert!(now >= 0, "completion event over-completed");
        self.count.set(now);
        if now == 0 && !self.waiters.is_empty() {
            let core = crate::runtime::core();
            self.waiters.wake_all(&core.sched);
        }
    }

    /// Park the calling worker until the counter reaches zero. Returns
    /// immediately when it already is.
    pub fn wait(&self) {
        while self.count.get() > 0 {
            let core = crate::runtime::core();
            core.sched.block_on(&self.waiters);
        }
    }

    pub fn count(&self) -> i64 {
        self.count.get()
    }
}

impl Default for CompletionEvent {
    fn default() -> Self {
        CompletionEvent::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enroll_then_complete_restores_zero() {
        let ce = CompletionEvent::new();
        ce.enroll(5);
        assert_eq!(ce.count(), 5);
        ce.complete(3);
        ce.complete(2);
        // Indistinguishable from never having touched it.
        assert_eq!(ce.count(), 0);
    }

    #[test]
    fn test_batched_enroll() {
        let ce = CompletionEvent::new();
        ce.enroll(2);
        ce.enroll(2);
        ce.complete(4);
        assert_eq!(ce.count(), 0);
    }
}
