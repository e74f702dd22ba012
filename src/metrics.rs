//! Per-core runtime counters.
//!
//! Each core samples into plain cells (single-threaded by construction) and
//! snapshots are merged process-wide at shutdown or on a stats-dump signal.

use serde::Serialize;
use std::cell::Cell;
use std::fmt;

/// Live counters for one core. Shared by the scheduler, task manager,
/// communicator and aggregator via `Rc`.
#[derive(Default)]
pub(crate) struct Metrics {
    pub resumes: Cell<u64>,
    pub yields: Cell<u64>,
    pub blocks: Cell<u64>,
    pub worker_spawns: Cell<u64>,
    pub tasks_spawned_private: Cell<u64>,
    pub tasks_spawned_public: Cell<u64>,
    pub tasks_executed: Cell<u64>,
    pub steal_requests: Cell<u64>,
    pub steal_replies_empty: Cell<u64>,
    pub tasks_stolen_in: Cell<u64>,
    pub tasks_stolen_out: Cell<u64>,
    pub messages_sent: Cell<u64>,
    pub messages_delivered: Cell<u64>,
    pub bytes_sent: Cell<u64>,
    pub batches_delivered: Cell<u64>,
    pub flushes_size: Cell<u64>,
    pub flushes_age: Cell<u64>,
    pub flushes_explicit: Cell<u64>,
    pub polls: Cell<u64>,
    pub barriers: Cell<u64>,
}

impl Metrics {
    pub(crate) fn bump(cell: &Cell<u64>) {
        cell.set(cell.get() + 1);
    }

    pub(crate) fn add(cell: &Cell<u64>, n: u64) {
        cell.set(cell.get() + n);
    }

    pub(crate) fn snapshot(&self, core: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            core,
            resumes: self.resumes.get(),
            yields: self.yields.get(),
            blocks: self.blocks.get(),
            worker_spawns: self.worker_spawns.get(),
            tasks_spawned_private: self.tasks_spawned_private.get(),
            tasks_spawned_public: self.tasks_spawned_public.get(),
            tasks_executed: self.tasks_executed.get(),
            steal_requests: self.steal_requests.get(),
            steal_replies_empty: self.steal_replies_empty.get(),
            tasks_stolen_in: self.tasks_stolen_in.get(),
            tasks_stolen_out: self.tasks_stolen_out.get(),
            messages_sent: self.messages_sent.get(),
            messages_delivered: self.messages_delivered.get(),
            bytes_sent: self.bytes_sent.get(),
            batches_delivered: self.batches_delivered.get(),
            flushes_size: self.flushes_size.get(),
            flushes_age: self.flushes_age.get(),
            flushes_explicit: self.flushes_explicit.get(),
            polls: self.polls.get(),
            barriers: self.barriers.get(),
        }
    }
}

/// Frozen copy of one core's counters.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct MetricsSnapshot {
    pub core: usize,
    pub resumes: u64,
    pub yields: u64,
    pub blocks: u64,
    pub worker_spawns: u64,
    pub tasks_spawned_private: u64,
    pub tasks_spawned_public: u64,
    pub tasks_executed: u64,
    pub steal_requests: u64,
    pub steal_replies_empty: u64,
    pub tasks_stolen_in: u64,
    pub tasks_stolen_out: u64,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub bytes_sent: u64,
    pub batches_delivered: u64,
    pub flushes_size: u64,
    pub flushes_age: u64,
    pub flushes_explicit: u64,
    pub polls: u64,
    pub barriers: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "core {}: tasks {}/{}p+{}u, stolen {}in/{}out, msgs {}s/{}d, \
             flushes {}sz/{}age/{}ex, resumes {}, yields {}, polls {}, barriers {}",
            self.core,
            self.tasks_executed,
            self.tasks_spawned_private,
            self.tasks_spawned_public,
            self.tasks_stolen_in,
            self.tasks_stolen_out,
            self.messages_sent,
            self.messages_delivered,
            self.flushes_size,
            self.flushes_age,
            self.flushes_explicit,
            self.resumes,
            self.yields,
            self.polls,
            self.barriers,
        )
    }
}

/// Aggregated counters for a completed run, one snapshot per core.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub per_core: Vec<MetricsSnapshot>,
}

impl RunStats {
    pub fn tasks_spawned(&self) -> u64 {
        self.per_core
            .iter()
            .map(|m| m.tasks_spawned_private + m.tasks_spawned_public)
            .sum()
    }

    pub fn tasks_executed(&self) -> u64 {
        self.per_core.iter().map(|m| m.tasks_executed).sum()
    }

    pub fn messages_sent(&self) -> u64 {
        self.per_core.iter().map(|m| m.messages_sent).sum()
    }

    pub fn messages_delivered(&self) -> u64 {
        self.per_core.iter().map(|m| m.messages_delivered).sum()
    }

    pub fn tasks_stolen(&self) -> u64 {
        self.per_core.iter().map(|m| m.tasks_stolen_in).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_counters() {
        let m = Metrics::default();
        Metrics::bump(&m.tasks_executed);
        Metrics::add(&m.bytes_sent, 128);
        let snap = m.snapshot(3);
        assert_eq!(snap.core, 3);
        assert_eq!(snap.tasks_executed, 1);
        assert_eq!(snap.bytes_sent, 128);
    }

    #[test]
    fn test_run_stats_totals() {
        let mut stats = RunStats::default();
        for core in 0..3 {
            let m = Metrics::default();
            Metrics::add(&m.tasks_executed, 10);
            Metrics::add(&m.tasks_spawned_private, 4);
            Metrics::add(&m.tasks_spawned_public, 6);
            stats.per_core.push(m.snapshot(core));
        }
        assert_eq!(stats.tasks_executed(), 30);
        assert_eq!(stats.tasks_spawned(), 30);
    }
}
