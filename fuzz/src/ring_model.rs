//! Shadow model of the event signal ring.
//!
//! A single thread plays both the recorder and the stream. A record whose
//! slot is still occupied would block in `claim`, so the model first
//! completes the occupant, which is what the waiting recorder relies on.

use std::collections::BTreeSet;

use gpucompat_core::{PollPolicy, WaitableFlag};
use gpucompat_ipc::{EventSegmentHeader, EventStatus, SignalRing, IPC_SIGNALS_PER_EVENT};

const RING: i64 = IPC_SIGNALS_PER_EVENT as i64;

/// One step applied to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingOp {
    Record,
    /// Complete the n-th outstanding record (mod the number outstanding).
    /// Streams complete in order, but records from different streams may
    /// finish in any order.
    Complete(u8),
    CompleteAll,
    Query,
}

pub struct RingModel {
    header: Box<EventSegmentHeader>,
    /// Write indices recorded but not completed.
    outstanding: BTreeSet<i64>,
    last_read_index: i64,
}

impl Default for RingModel {
    fn default() -> Self {
        Self::new()
    }
}

impl RingModel {
    pub fn new() -> Self {
        let header = Box::new(EventSegmentHeader::detached());
        header.initialize(gpucompat_core::DeviceId(0), 1);
        Self {
            header,
            outstanding: BTreeSet::new(),
            last_read_index: -1,
        }
    }

    fn ring(&self) -> SignalRing<'_> {
        SignalRing::new(&self.header)
    }

    fn complete(&mut self, index: i64) {
        self.ring().slot(index.rem_euclid(RING) as usize).clear();
        self.outstanding.remove(&index);
    }

    pub fn apply(&mut self, op: RingOp) -> Result<(), String> {
        match op {
            RingOp::Record => {
                let next = self.ring().write_index();
                // Stand in for the stream the recorder is waiting on.
                let occupant = self.outstanding.iter().copied().find(|i| (next - i) % RING == 0);
                if let Some(occupant) = occupant {
                    self.complete(occupant);
                }

                let offset = next.rem_euclid(RING) as usize;
                if self.ring().slot(offset).is_raised() {
                    return Err(format!("slot {offset} still raised before claim of {next}"));
                }

                let claim = self.ring().claim(PollPolicy::Spin);
                if claim.write_index != next {
                    return Err(format!("claimed {} expected {next}", claim.write_index));
                }
                self.ring().slot(claim.offset).raise();
                self.ring().publish(claim.write_index, PollPolicy::Spin);
                self.outstanding.insert(claim.write_index);
            }
            RingOp::Complete(n) => {
                if !self.outstanding.is_empty() {
                    let pick = n as usize % self.outstanding.len();
                    let index = self.outstanding.iter().copied().nth(pick);
                    if let Some(index) = index {
                        self.complete(index);
                    }
                }
            }
            RingOp::CompleteAll => {
                let all: Vec<_> = self.outstanding.iter().copied().collect();
                for index in all {
                    self.complete(index);
                }
            }
            RingOp::Query => {}
        }
        self.verify()
    }

    /// Invariants that hold after every step.
    pub fn verify(&mut self) -> Result<(), String> {
        let ring = self.ring();
        let read = ring.read_index();
        let write = ring.write_index();

        if read < self.last_read_index {
            return Err(format!("read_index went back from {} to {read}", self.last_read_index));
        }
        if read != write - 1 {
            return Err(format!("read_index {read} lags write_index {write} with no recorder"));
        }
        if self.outstanding.len() > IPC_SIGNALS_PER_EVENT {
            return Err(format!("{} records outstanding", self.outstanding.len()));
        }

        let expected = if self.outstanding.contains(&read) {
            EventStatus::NotReady
        } else {
            EventStatus::Ready
        };
        if ring.status() != expected {
            return Err(format!("status {:?} expected {expected:?} at read_index {read}", ring.status()));
        }

        for offset in 0..IPC_SIGNALS_PER_EVENT {
            let raised = ring.slot(offset).is_raised();
            let modeled = self
                .outstanding
                .iter()
                .any(|&i| i.rem_euclid(RING) as usize == offset);
            if raised != modeled {
                return Err(format!("slot {offset} raised={raised} but model says {modeled}"));
            }
        }

        self.last_read_index = read;
        Ok(())
    }
}

/// Run `ops` on a fresh ring, checking invariants after each step.
pub fn execute_and_verify(ops: &[RingOp]) -> Result<(), String> {
    let mut model = RingModel::new();
    model.verify()?;
    for (step, op) in ops.iter().enumerate() {
        model
            .apply(*op)
            .map_err(|e| format!("step {step} ({op:?}): {e}"))?;
    }
    Ok(())
}
