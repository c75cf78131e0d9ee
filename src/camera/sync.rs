//! Master/slave scheduling of logical frame indices.
//!
//! Every camera counts the same physical trigger pulses. The master decides
//! which count to sample next and tells the slaves; each camera reports a
//! capture once its own count reaches the target.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use super::CameraState;

/// Schedule owned by the master camera.
#[derive(Debug)]
pub struct MasterSchedule {
    step: u64,
    target: u64,
    peers: Vec<(usize, Sender<u64>)>,
}

impl MasterSchedule {
    pub fn new(step: u64, peers: Vec<(usize, Sender<u64>)>) -> Self {
        Self { step, target: 1 + step, peers }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Push the current target to every slave without blocking.
    pub fn broadcast(&self) {
        for (index, peer) in &self.peers {
            match peer.try_send(self.target) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(camera = index, target = self.target, "request queue full, request dropped");
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!(camera = index, "request queue closed");
                }
            }
        }
    }

    /// Returns the target reached by `counter`, then moves the target past it.
    pub fn fulfill(&mut self, counter: u64) -> Option<u64> {
        if counter < self.target {
            return None;
        }
        let reached = self.target;
        self.target = counter + self.step;
        self.broadcast();
        Some(reached)
    }
}

/// Schedule of a slave camera. Only the newest request is kept.
#[derive(Debug)]
pub struct SlaveSchedule {
    requests: Receiver<u64>,
    pending: Option<u64>,
}

impl SlaveSchedule {
    pub fn new(requests: Receiver<u64>) -> Self {
        Self { requests, pending: None }
    }

    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    pub fn fulfill(&mut self, counter: u64) -> Option<u64> {
        if let Some(latest) = self.requests.try_iter().last() {
            self.pending = Some(latest);
        }
        match self.pending {
            Some(target) if counter >= target => {
                self.pending = None;
                Some(target)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum SyncRole {
    Master(MasterSchedule),
    Slave(SlaveSchedule),
}

impl SyncRole {
    /// Build the role of `index` within `roster`.
    pub fn for_camera(roster: &[CameraState], index: usize, step: u64) -> SyncRole {
        if roster[index].identity().is_master {
            let peers = roster
                .iter()
                .filter(|c| c.index() != index)
                .map(|c| (c.index(), c.request_sender()))
                .collect();
            SyncRole::Master(MasterSchedule::new(step, peers))
        } else {
            SyncRole::Slave(SlaveSchedule::new(roster[index].request_receiver()))
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, SyncRole::Master(_))
    }

    /// Called once when the worker enters RUNNING.
    pub fn on_running(&self) {
        if let SyncRole::Master(m) = self {
            m.broadcast();
        }
    }

    /// Logical index to capture for this counter value, if any.
    pub fn fulfill(&mut self, counter: u64) -> Option<u64> {
        match self {
            SyncRole::Master(m) => m.fulfill(counter),
            SyncRole::Slave(s) => s.fulfill(counter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{roster_from, Backend, CameraIdentity};
    use crossbeam_channel::bounded;

    #[test]
    fn test_master_first_target() {
        let m = MasterSchedule::new(60, vec![]);
        assert_eq!(m.target(), 61);
    }

    #[test]
    fn test_master_ratchets_from_observed_counter() {
        let (tx, rx) = bounded(10);
        let mut m = MasterSchedule::new(10, vec![(1, tx)]);
        assert_eq!(m.fulfill(5), None);
        assert_eq!(m.fulfill(14), Some(11));
        assert_eq!(m.target(), 24);
        assert_eq!(rx.try_recv(), Ok(24));
        assert_eq!(m.fulfill(23), None);
        assert_eq!(m.fulfill(30), Some(24));
        assert_eq!(m.target(), 40);
    }

    #[test]
    fn test_master_target_always_exceeds_counter() {
        let mut m = MasterSchedule::new(3, vec![]);
        for counter in [1, 4, 4, 9, 100, 101, 250] {
            let _ = m.fulfill(counter);
            assert!(m.target() > counter);
        }
    }

    #[test]
    fn test_master_full_queue_is_not_fatal() {
        let (tx, rx) = bounded(1);
        let mut m = MasterSchedule::new(2, vec![(1, tx)]);
        m.broadcast();
        assert_eq!(m.fulfill(3), Some(3));
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv(), Ok(3));
    }

    #[test]
    fn test_slave_newest_request_wins() {
        let (tx, rx) = bounded(10);
        let mut s = SlaveSchedule::new(rx);
        tx.send(10).unwrap();
        tx.send(20).unwrap();
        assert_eq!(s.fulfill(15), None);
        assert_eq!(s.pending(), Some(20));
        assert_eq!(s.fulfill(20), Some(20));
        assert_eq!(s.pending(), None);
        assert_eq!(s.fulfill(25), None);
    }

    #[test]
    fn test_slave_never_fulfills_below_target() {
        let (tx, rx) = bounded(10);
        let mut s = SlaveSchedule::new(rx);
        tx.send(7).unwrap();
        for counter in 0..7 {
            assert_eq!(s.fulfill(counter), None);
        }
        assert_eq!(s.fulfill(9), Some(7));
    }

    #[test]
    fn test_role_fan_out_skips_master() {
        let roster = roster_from((0..3).map(|index| CameraIdentity {
            index,
            is_master: index == 1,
            backend: Backend::Frame,
        }));
        let master = SyncRole::for_camera(&roster, 1, 5);
        assert!(master.is_master());
        master.on_running();
        assert_eq!(roster[0].request_receiver().try_recv(), Ok(6));
        assert_eq!(roster[2].request_receiver().try_recv(), Ok(6));
        assert!(roster[1].request_receiver().try_recv().is_err());
        assert!(!SyncRole::for_camera(&roster, 2, 5).is_master());
    }
}
