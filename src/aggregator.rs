//! Per-destination aggregation of small messages into bulk transfers.
//!
//! Outbound closures land in a per-destination buffer; a buffer goes out as
//! one batch when it crosses the byte threshold, when it ages past the flush
//! bound (checked from the polling worker), or on an explicit flush during a
//! collective. Flush buffers circulate through a bounded spare pool, the
//! shared message pool: batches delivered to this core are recycled into it,
//! and replacements are drawn from it before touching the allocator.

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::error;

use crate::message;
use crate::metrics::Metrics;
use crate::semaphore::ReusePool;
use crate::transport::{Core, Endpoint, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushCause {
    Size,
    Age,
    Explicit,
}

struct DestBuf {
    buf: Vec<u8>,
    /// When the oldest message in the buffer was enqueued.
    since: Option<Instant>,
}

pub(crate) struct Aggregator {
    bufs: RefCell<Vec<DestBuf>>,
    threshold: usize,
    max_age: Duration,
    /// Spare flush buffers; delivered batches come home here.
    pool: ReusePool<Vec<u8>>,
    metrics: Rc<Metrics>,
}

impl Aggregator {
    pub(crate) fn new(
        cores: usize,
        threshold: usize,
        max_age: Duration,
        pool_bytes: usize,
        metrics: Rc<Metrics>,
    ) -> Self {
        let pool_slots = (pool_bytes / threshold).max(2);
        let mut bufs = Vec::with_capacity(cores);
        for _ in 0..cores {
            bufs.push(DestBuf {
                buf: Vec::with_capacity(threshold),
                since: None,
            });
        }
        Aggregator {
            bufs: RefCell::new(bufs),
            threshold,
            max_age,
            pool: ReusePool::new(pool_slots),
            metrics,
        }
    }

    /// Serialize `f` for `dst`. Returns whether the buffer crossed the byte
    /// threshold and was flushed, so the caller can choose to yield.
    pub(crate) fn enqueue<F>(&self, endpoint: &Endpoint, dst: Core, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let full = {
            let mut bufs = self.bufs.borrow_mut();
            let b = &mut bufs[dst];
            if b.buf.is_empty() {
                b.since = Some(Instant::now());
            }
            message::push_closure(&mut b.buf, f);
            b.buf.len() >= self.threshold
        };
        if full {
            self.flush(endpoint, dst, FlushCause::Size);
        }
        full
    }

    /// As [`enqueue`](Self::enqueue), with a trailing opaque payload.
    pub(crate) fn enqueue_with_payload<F>(
        &self,
        endpoint: &Endpoint,
        dst: Core,
        f: F,
        payload: &[u8],
    ) -> bool
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        let full = {
            let mut bufs = self.bufs.borrow_mut();
            let b = &mut bufs[dst];
            if b.buf.is_empty() {
                b.since = Some(Instant::now());
            }
            message::push_closure_with_payload(&mut b.buf, f, payload);
            b.buf.len() >= self.threshold
        };
        if full {
            self.flush(endpoint, dst, FlushCause::Size);
        }
        full
    }

    /// Ship the buffer for `dst` as one batch. Returns whether anything was
    /// sent.
    pub(crate) fn flush(&self, endpoint: &Endpoint, dst: Core, cause: FlushCause) -> bool {
        let replacement = self
            .pool
            .try_pop()
            .unwrap_or_else(|| Vec::with_capacity(self.threshold));
        let out = {
            let mut bufs = self.bufs.borrow_mut();
            let b = &mut bufs[dst];
            if b.buf.is_empty() {
                drop(bufs);
                self.recycle(replacement);
                return false;
            }
            b.since = None;
            mem::replace(&mut b.buf, replacement)
        };
        Metrics::add(&self.metrics.bytes_sent, out.len() as u64);
        match cause {
            FlushCause::Size => Metrics::bump(&self.metrics.flushes_size),
            FlushCause::Age => Metrics::bump(&self.metrics.flushes_age),
            FlushCause::Explicit => Metrics::bump(&self.metrics.flushes_explicit),
        }
        if let Err(e) = endpoint.send(dst, Packet::Batch(out)) {
            // No per-message recovery below the application layer.
            error!(dst, %e, "batch delivery failed");
            panic!("transport failure: {e}");
        }
        true
    }

    /// Age-triggered flushes, driven by the polling worker.
    pub(crate) fn tick(&self, endpoint: &Endpoint) {
        let cores = { self.bufs.borrow().len() };
        for dst in 0..cores {
            let due = {
                let bufs = self.bufs.borrow();
                matches!(bufs[dst].since, Some(t) if t.elapsed() >= self.max_age)
            };
            if due {
                self.flush(endpoint, dst, FlushCause::Age);
            }
        }
    }

    /// Flush every destination, e.g. while entering a collective.
    pub(crate) fn flush_all(&self, endpoint: &Endpoint) {
        let cores = { self.bufs.borrow().len() };
        for dst in 0..cores {
            self.flush(endpoint, dst, FlushCause::Explicit);
        }
    }

    /// Return a delivered batch buffer to the spare pool; overflow beyond
    /// the negotiated pool bound is dropped.
    pub(crate) fn recycle(&self, mut buf: Vec<u8>) {
        buf.clear();
        if buf.capacity() > 0 {
            self.pool.try_push(buf);
        }
    }

    pub(crate) fn pooled_buffers(&self) -> i64 {
        self.pool.count()
    }
}
