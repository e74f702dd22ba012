//! Communicator: typed-closure sends, inbound dispatch, and the collective
//! barrier.
//!
//! Sends go through the aggregator; control frames go straight to the wire.
//! `poll` drains the inbox and runs every delivered closure on this core.
//! The barrier flushes, reports to rank 0, drains the inbox once every core
//! has arrived, and returns only after rank 0 has seen every core drain, so
//! everything issued before the barrier has been delivered everywhere when
//! it releases.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tracing::error;

use crate::aggregator::Aggregator;
use crate::gce;
use crate::message;
use crate::metrics::Metrics;
use crate::runtime::CoreState;
use crate::task::TaskManager;
use crate::transport::{Core, Ctrl, Endpoint, Packet};
use crate::worker;

/// Park granularity while waiting on a barrier flag outside any worker.
const DIRECT_POLL: Duration = Duration::from_micros(100);

pub(crate) struct Communicator {
    endpoint: Endpoint,
    aggregator: Aggregator,
    /// Nonzero while a batch is being delivered on this core. Delivery must
    /// not suspend: a mid-batch yield would let another poll run later
    /// messages from the same sender first, breaking per-sender FIFO.
    delivering: Cell<u32>,
    barrier_all: Cell<bool>,
    barrier_release: Cell<bool>,
    // Rank 0 tallies.
    barrier_arrivals: Cell<usize>,
    barrier_drains: Cell<usize>,
    metrics: Rc<Metrics>,
}

impl Communicator {
    pub(crate) fn new(endpoint: Endpoint, aggregator: Aggregator, metrics: Rc<Metrics>) -> Self {
        Communicator {
            endpoint,
            aggregator,
            delivering: Cell::new(0),
            barrier_all: Cell::new(false),
            barrier_release: Cell::new(false),
            barrier_arrivals: Cell::new(0),
            barrier_drains: Cell::new(0),
            metrics,
        }
    }

    /// Enqueue a closure for execution on `dst`. The caller never suspends,
    /// except that a send which fills a buffer yields once after the flush
    /// so the receiving side can keep pace with a tight send loop.
    pub(crate) fn send_immediate<F>(&self, dst: Core, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        Metrics::bump(&self.metrics.messages_sent);
        if self.aggregator.enqueue(&self.endpoint, dst, f) {
            self.yield_after_flush();
        }
    }

    /// As [`send_immediate`](Self::send_immediate), with a trailing opaque
    /// payload handed to the closure at the destination.
    pub(crate) fn send_immediate_with_payload<F>(&self, dst: Core, f: F, payload: &[u8])
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        Metrics::bump(&self.metrics.messages_sent);
        if self
            .aggregator
            .enqueue_with_payload(&self.endpoint, dst, f, payload)
        {
            self.yield_after_flush();
        }
    }

    fn yield_after_flush(&self) {
        if self.delivering.get() == 0 && worker::in_worker() {
            if let Some(core) = crate::runtime::try_core() {
                core.sched.yield_now();
            }
        }
    }

    pub(crate) fn send_ctrl(&self, dst: Core, ctrl: Ctrl) {
        if let Err(e) = self.endpoint.send(dst, Packet::Ctrl(ctrl)) {
            error!(dst, %e, "control frame delivery failed");
            panic!("transport failure: {e}");
        }
    }

    pub(crate) fn broadcast_ctrl(&self, ctrl: Ctrl) {
        for dst in 0..self.endpoint.cores() {
            self.send_ctrl(dst, ctrl);
        }
    }

    pub(crate) fn flush_all(&self) {
        self.aggregator.flush_all(&self.endpoint);
    }

    /// Age-based flush pass, driven by the polling worker.
    pub(crate) fn tick(&self) {
        self.aggregator.tick(&self.endpoint);
    }

    /// Spare buffers currently in the shared message pool.
    pub(crate) fn pooled_buffers(&self) -> i64 {
        self.aggregator.pooled_buffers()
    }

    /// Drain the inbox, dispatching every closure and control frame on this
    /// core. Returns the number of items processed; on return the inbox has
    /// been observed empty, which settles any pending drain acks.
    pub(crate) fn poll(&self, core: &CoreState) -> usize {
        Metrics::bump(&self.metrics.polls);
        let mut n = 0;
        while let Some(pkt) = self.endpoint.try_recv() {
            n += self.handle_packet(core, pkt);
        }
        core.tasks.ack_drained_if_pending(core);
        n
    }

    /// Blocking variant used by the idle master: parks on the inbox up to
    /// `timeout`, then drains whatever arrived.
    pub(crate) fn poll_blocking(&self, core: &CoreState, timeout: Duration) {
        match self.endpoint.recv_timeout(timeout) {
            Some(pkt) => {
                self.handle_packet(core, pkt);
                self.poll(core);
            }
            None => core.tasks.ack_drained_if_pending(core),
        }
    }

    fn handle_packet(&self, core: &CoreState, pkt: Packet) -> usize {
        match pkt {
            Packet::Batch(mut buf) => {
                self.delivering.set(self.delivering.get() + 1);
                let delivered = message::deliver(&mut buf);
                self.delivering.set(self.delivering.get() - 1);
                Metrics::add(&self.metrics.messages_delivered, delivered as u64);
                Metrics::bump(&self.metrics.batches_delivered);
                self.aggregator.recycle(buf);
                delivered
            }
            Packet::Ctrl(ctrl) => {
                self.dispatch(core, ctrl);
                1
            }
        }
    }

    fn dispatch(&self, core: &CoreState, ctrl: Ctrl) {
        match ctrl {
            Ctrl::BarrierArrive { .. } => {
                debug_assert_eq!(core.core, 0);
                self.barrier_arrivals.set(self.barrier_arrivals.get() + 1);
                if self.barrier_arrivals.get() == core.cores {
                    self.barrier_arrivals.set(0);
                    self.broadcast_ctrl(Ctrl::BarrierAll);
                }
            }
            Ctrl::BarrierAll => self.barrier_all.set(true),
            Ctrl::BarrierDrained { .. } => {
                debug_assert_eq!(core.core, 0);
                self.barrier_drains.set(self.barrier_drains.get() + 1);
                if self.barrier_drains.get() == core.cores {
                    self.barrier_drains.set(0);
                    self.broadcast_ctrl(Ctrl::BarrierRelease);
                }
            }
            Ctrl::BarrierRelease => self.barrier_release.set(true),
            Ctrl::GceActive { id, core: from } => gce::handle_active(core, id, from),
            Ctrl::GceZero { id, core: from } => gce::handle_zero(core, id, from),
            Ctrl::GceRelease { id } => gce::handle_release(core, id),
            Ctrl::Shutdown => core.done.set(true),
            other => TaskManager::handle_ctrl(core, other),
        }
    }

    /// Collective barrier. Returns only after every core has entered it and
    /// every message issued before it has been delivered. Works both from a
    /// worker (yielding between polls) and from the bare master thread
    /// during activation (parking between polls).
    pub(crate) fn barrier(&self, core: &CoreState) {
        Metrics::bump(&self.metrics.barriers);
        let yielding = worker::in_worker();
        self.barrier_all.set(false);
        self.barrier_release.set(false);
        self.flush_all();
        self.send_ctrl(0, Ctrl::BarrierArrive { core: core.core });
        self.wait_flag(core, yielding, &self.barrier_all);
        // All cores are inside the barrier: every pre-barrier batch already
        // sits in some inbox. Drain ours dry.
        while self.poll(core) > 0 {}
        self.send_ctrl(0, Ctrl::BarrierDrained { core: core.core });
        self.wait_flag(core, yielding, &self.barrier_release);
    }

    fn wait_flag(&self, core: &CoreState, yielding: bool, flag: &Cell<bool>) {
        while !flag.get() {
            if self.poll(core) == 0 {
                if yielding {
                    core.sched.yield_now();
                } else {
                    self.poll_blocking(core, DIRECT_POLL);
                }
            }
        }
    }
}
