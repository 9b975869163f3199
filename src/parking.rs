//! Bookkeeping for messages that reach a node ahead of their run.
//!
//! Followers may see a peer's first round before the leader's Request, and a
//! follower waiting on approval has not registered its run yet. Such messages
//! are parked here until the run registers, and dropped once they outlive the
//! run they were meant for.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::MpcConfig;
use crate::message::WireMessage;

/// Why a message was not parked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParkRefusal {
    TooManyRuns,
    RunFull,
    OutOfSpace,
}

struct Parked {
    since: Instant,
    bytes: usize,
    messages: Vec<WireMessage>,
}

pub struct ParkingLot {
    max_runs: usize,
    max_per_run: usize,
    max_bytes: usize,
    ttl: Duration,
    runs: HashMap<u64, Parked>,
    bytes: usize,
}

impl ParkingLot {
    pub fn new(config: &MpcConfig) -> Self {
        ParkingLot {
            max_runs: config.max_parked_messages,
            max_per_run: config.max_parked_messages,
            max_bytes: config.max_parked_bytes,
            ttl: config.protocol_timeout(),
            runs: HashMap::new(),
            bytes: 0,
        }
    }

    /// Park `wire`, whose encoding took `size` bytes. Expired runs are evicted first.
    pub fn park(&mut self, wire: WireMessage, size: usize, now: Instant) -> Result<(), ParkRefusal> {
        self.expire(now);
        if self.bytes + size > self.max_bytes {
            return Err(ParkRefusal::OutOfSpace);
        }
        if !self.runs.contains_key(&wire.run_id) && self.runs.len() >= self.max_runs {
            return Err(ParkRefusal::TooManyRuns);
        }
        let parked = self.runs.entry(wire.run_id).or_insert_with(|| Parked {
            since: now,
            bytes: 0,
            messages: vec![],
        });
        if parked.messages.len() >= self.max_per_run {
            return Err(ParkRefusal::RunFull);
        }
        parked.bytes += size;
        parked.messages.push(wire);
        self.bytes += size;
        Ok(())
    }

    /// Hand over everything parked for `run_id`.
    pub fn take(&mut self, run_id: u64) -> Vec<WireMessage> {
        match self.runs.remove(&run_id) {
            Some(parked) => {
                self.bytes -= parked.bytes;
                parked.messages
            }
            None => vec![],
        }
    }

    pub fn discard(&mut self, run_id: u64) {
        self.take(run_id);
    }

    /// Drop runs parked for longer than a whole run may last.
    pub fn expire(&mut self, now: Instant) {
        let ttl = self.ttl;
        let mut freed = 0;
        self.runs.retain(|_, parked| {
            let keep = now.saturating_duration_since(parked.since) < ttl;
            if !keep {
                freed += parked.bytes;
            }
            keep
        });
        self.bytes -= freed;
    }

    pub fn runs(&self) -> usize {
        self.runs.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Run ids this node admitted as a follower, remembered for a while after the run ends.
pub struct RecentRuns {
    ttl: Duration,
    admitted: HashMap<u64, Instant>,
}

impl RecentRuns {
    pub fn new(ttl: Duration) -> Self {
        RecentRuns {
            ttl,
            admitted: HashMap::new(),
        }
    }

    /// `false` when `run_id` was already admitted within the memory window.
    pub fn admit(&mut self, run_id: u64, now: Instant) -> bool {
        let ttl = self.ttl;
        self.admitted
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
        if self.admitted.contains_key(&run_id) {
            return false;
        }
        self.admitted.insert(run_id, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{NodeId, StepMessage};

    fn wire(run_id: u64) -> WireMessage {
        WireMessage {
            run_id,
            step_id: 2,
            message: StepMessage::mpc(NodeId::new("node1"), None),
        }
    }

    fn lot(max_parked_messages: usize, max_parked_bytes: usize) -> ParkingLot {
        ParkingLot::new(&MpcConfig {
            protocol_timeout_ms: 1_000,
            max_parked_messages,
            max_parked_bytes,
            ..MpcConfig::default()
        })
    }

    #[test]
    fn stale_runs_are_evicted() {
        let start = Instant::now();
        let mut lot = lot(2, 1_000);
        lot.park(wire(1), 100, start).unwrap();
        lot.park(wire(2), 100, start + Duration::from_millis(600)).unwrap();
        assert_eq!(lot.park(wire(3), 100, start + Duration::from_millis(900)), Err(ParkRefusal::TooManyRuns));

        // run 1 has outlived a whole run, which makes room for run 3
        lot.park(wire(3), 100, start + Duration::from_millis(1_000)).unwrap();
        assert_eq!(lot.runs(), 2);
        assert_eq!(lot.bytes(), 200);
        assert!(lot.take(1).is_empty());
        assert_eq!(lot.take(2).len(), 1);

        lot.expire(start + Duration::from_secs(5));
        assert_eq!(lot.runs(), 0);
        assert_eq!(lot.bytes(), 0);
    }

    #[test]
    fn parking_is_bounded_by_bytes_and_per_run() {
        let now = Instant::now();
        let mut lot = lot(2, 250);
        lot.park(wire(1), 100, now).unwrap();
        lot.park(wire(1), 100, now).unwrap();
        assert_eq!(lot.park(wire(1), 10, now), Err(ParkRefusal::RunFull));
        assert_eq!(lot.park(wire(2), 100, now), Err(ParkRefusal::OutOfSpace));

        lot.discard(1);
        assert_eq!(lot.bytes(), 0);
        lot.park(wire(2), 100, now).unwrap();
        assert_eq!(lot.take(2).len(), 1);
    }

    #[test]
    fn repeated_admissions_are_refused_until_forgotten() {
        let start = Instant::now();
        let mut recent = RecentRuns::new(Duration::from_secs(10));
        assert!(recent.admit(7, start));
        assert!(!recent.admit(7, start + Duration::from_secs(3)));
        assert!(recent.admit(8, start + Duration::from_secs(3)));
        assert!(recent.admit(7, start + Duration::from_secs(10)));
    }
}
