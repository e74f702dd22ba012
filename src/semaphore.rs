//! Counting semaphore and the reuse pool built on it.
//!
//! The semaphore is a counter plus a wait queue: `decrement` parks the
//! calling worker while the count is zero, `increment` wakes one waiter.
//! [`ReusePool`] stores reusable objects behind such a semaphore; its value
//! always equals the number of objects currently stored.

use std::cell::{Cell, RefCell};

use crate::scheduler::WaitList;

pub(crate) struct CountingSemaphore {
    value: Cell<i64>,
    waiters: WaitList,
}

impl CountingSemaphore {
    pub(crate) fn new(initial: i64) -> Self {
        CountingSemaphore {
            value: Cell::new(initial),
            waiters: WaitList::new(),
        }
    }

    pub(crate) fn get_value(&self) -> i64 {
        self.value.get()
    }

    /// Raise the count and wake one waiter, if any. Never suspends.
    pub(crate) fn increment(&self) {
        self.value.set(self.value.get() + 1);
        if !self.waiters.is_empty() {
            let core = crate::runtime::core();
            self.waiters.wake_one(&core.sched);
        }
    }

    /// Lower the count, parking the calling worker while it is zero.
    pub(crate) fn decrement(&self) {
        loop {
            if self.value.get() > 0 {
                self.value.set(self.value.get() - 1);
                return;
            }
            let core = crate::runtime::core();
            core.sched.block_on(&self.waiters);
        }
    }

    /// Lower the count without suspending; false if it was zero.
    pub(crate) fn try_decrement(&self) -> bool {
        if self.value.get() > 0 {
            self.value.set(self.value.get() - 1);
            true
        } else {
            false
        }
    }
}

/// Bounded stack of reusable objects guarded by a counting semaphore.
pub(crate) struct ReusePool<T> {
    s: CountingSemaphore,
    slots: RefCell<Vec<T>>,
    capacity: usize,
}

impl<T> ReusePool<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        ReusePool {
            s: CountingSemaphore::new(0),
            slots: RefCell::new(Vec::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub(crate) fn count(&self) -> i64 {
        self.s.get_value()
    }

    /// Pop an object, parking the calling worker until one is pushed.
    pub(crate) fn block_until_pop(&self) -> T {
        self.s.decrement();
        self.slots
            .borrow_mut()
            .pop()
            .expect("semaphore value exceeded stored objects")
    }

    pub(crate) fn try_pop(&self) -> Option<T> {
        if self.s.try_decrement() {
            Some(
                self.slots
                    .borrow_mut()
                    .pop()
                    .expect("semaphore value exceeded stored objects"),
            )
        } else {
            None
        }
    }

    /// Store an object. Panics when the pool is full; use [`try_push`] when
    /// overflow is expected.
    ///
    /// [`try_push`]: ReusePool::try_push
    pub(crate) fn push(&self, obj: T) {
        assert!(
            (self.s.get_value() as usize) < self.capacity,
            "reuse pool overflow (capacity {})",
            self.capacity
        );
        self.slots.borrow_mut().push(obj);
        self.s.increment();
    }

    /// Store an object unless the pool is full.
    pub(crate) fn try_push(&self, obj: T) -> bool {
        if (self.s.get_value() as usize) < self.capacity {
            self.push(obj);
            true
        } else {
            false
        }
    }
}
