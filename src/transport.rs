//! Core fabric: the named interface over the underlying transport.
//!
//! Each core owns one MPSC inbox; any core may send to any inbox. Delivery is
//! FIFO per sender-receiver pair (in fact the inbox totally orders arrivals by
//! enqueue time, which the control-plane protocols rely on). The fabric
//! carries two kinds of packets: opaque aggregated closure batches, and small
//! typed control frames that must bypass aggregation.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

/// Dense core index, `0..cores`.
pub type Core = usize;

/// One unit on the wire.
pub(crate) enum Packet {
    /// A packed stream of serialized closure envelopes.
    Batch(Vec<u8>),
    /// A control frame; never aggregated.
    Ctrl(Ctrl),
}

/// Control frames for the collective and termination protocols. These ride
/// outside the aggregator so their enqueue order tracks program order at the
/// sender, which the safety arguments for the protocols require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ctrl {
    /// Sender entered the barrier (to rank 0).
    BarrierArrive { core: Core },
    /// All cores have arrived; begin draining (broadcast from rank 0).
    BarrierAll,
    /// Sender's inbox was observed empty after all-arrived (to rank 0).
    BarrierDrained { core: Core },
    /// Barrier complete (broadcast from rank 0).
    BarrierRelease,
    /// Sender's local count for the event reached zero (to rank 0).
    GceZero { id: usize, core: Core },
    /// Sender's local count for the event left zero (to rank 0).
    GceActive { id: usize, core: Core },
    /// Every core is locally complete; release waiters (broadcast).
    GceRelease { id: usize },
    /// Sender drained its queues after the termination signal (to rank 0).
    Quiescent { core: Core },
    /// Sender received work while quiescent (to rank 0).
    Awake { core: Core },
    /// Termination probe; phase 1 flushes, phase 2 drains (broadcast).
    TermProbe { round: u64, phase: u8 },
    /// Probe response carrying whether the sender is still idle (to rank 0).
    TermAck { core: Core, round: u64, phase: u8, idle: bool },
    /// Tasking is globally complete; parked workers may exit (broadcast).
    TasksDone,
    /// Process-wide done flag; the scheduler drains and exits (broadcast).
    Shutdown,
}

/// Constructor for the per-core endpoints of one job.
pub(crate) struct Fabric {
    senders: Arc<Vec<Sender<Packet>>>,
    inboxes: Vec<Option<Receiver<Packet>>>,
}

impl Fabric {
    pub(crate) fn new(cores: usize) -> Self {
        let mut senders = Vec::with_capacity(cores);
        let mut inboxes = Vec::with_capacity(cores);
        for _ in 0..cores {
            let (tx, rx) = channel::unbounded();
            senders.push(tx);
            inboxes.push(Some(rx));
        }
        Fabric {
            senders: Arc::new(senders),
            inboxes,
        }
    }

    /// Take the endpoint for `core`. Each may be taken once.
    pub(crate) fn endpoint(&mut self, core: Core) -> Endpoint {
        Endpoint {
            core,
            peers: Arc::clone(&self.senders),
            inbox: self.inboxes[core].take().expect("endpoint already taken"),
        }
    }
}

/// A core's handle on the fabric.
pub(crate) struct Endpoint {
    core: Core,
    peers: Arc<Vec<Sender<Packet>>>,
    inbox: Receiver<Packet>,
}

impl Endpoint {
    pub(crate) fn cores(&self) -> usize {
        self.peers.len()
    }

    pub(crate) fn send(&self, dst: Core, pkt: Packet) -> Result<(), Error> {
        match self.peers[dst].try_send(pkt) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(Error::Transport(format!(
                "endpoint {dst} disconnected (send from {})",
                self.core
            ))),
            // Unbounded channels never report Full.
            Err(TrySendError::Full(_)) => unreachable!("unbounded channel reported full"),
        }
    }

    pub(crate) fn try_recv(&self) -> Option<Packet> {
        self.inbox.try_recv().ok()
    }

    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Option<Packet> {
        match self.inbox.recv_timeout(timeout) {
            Ok(pkt) => Some(pkt),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairwise_fifo() {
        let mut fabric = Fabric::new(2);
        let a = fabric.endpoint(0);
        let b = fabric.endpoint(1);
        for i in 0..10 {
            a.send(1, Packet::Ctrl(Ctrl::TermAck { core: 0, round: i, phase: 1, idle: true }))
                .unwrap();
        }
        for i in 0..10 {
            match b.try_recv() {
                Some(Packet::Ctrl(Ctrl::TermAck { round, .. })) => assert_eq!(round, i),
                other => panic!("unexpected packet at {i}: {:?}", other.is_some()),
            }
        }
        assert!(b.try_recv().is_none());
    }

    #[test]
    fn test_self_send() {
        let mut fabric = Fabric::new(1);
        let a = fabric.endpoint(0);
        a.send(0, Packet::Ctrl(Ctrl::Shutdown)).unwrap();
        assert!(matches!(a.try_recv(), Some(Packet::Ctrl(Ctrl::Shutdown))));
    }

    #[test]
    fn test_recv_timeout_expires() {
        let mut fabric = Fabric::new(1);
        let a = fabric.endpoint(0);
        assert!(a.recv_timeout(Duration::from_millis(1)).is_none());
    }
}
