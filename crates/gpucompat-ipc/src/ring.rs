//! The signal ring stored in an event segment.

use std::sync::atomic::Ordering;

use gpucompat_core::{poll_until, PollPolicy, RuntimeError, WaitableFlag};

use crate::layout::{EventSegmentHeader, SignalSlot, IPC_SIGNALS_PER_EVENT};

const RING: i64 = IPC_SIGNALS_PER_EVENT as i64;

/// Whether the most recent record of an event has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Ready,
    NotReady,
}

impl EventStatus {
    pub fn is_ready(self) -> bool {
        self == EventStatus::Ready
    }

    pub fn into_result(self) -> Result<(), RuntimeError> {
        match self {
            EventStatus::Ready => Ok(()),
            EventStatus::NotReady => Err(RuntimeError::NotReady),
        }
    }
}

/// A ring position handed to a recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub write_index: i64,
    pub offset: usize,
}

/// A snapshot of the last published record, as seen by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub read_index: i64,
    pub offset: usize,
}

/// View over the ring part of an [`EventSegmentHeader`].
#[derive(Debug, Clone, Copy)]
pub struct SignalRing<'a> {
    header: &'a EventSegmentHeader,
}

impl<'a> SignalRing<'a> {
    pub fn new(header: &'a EventSegmentHeader) -> Self {
        Self { header }
    }

    #[inline]
    pub fn slot(&self, offset: usize) -> &'a SignalSlot {
        &self.header.signals[offset % IPC_SIGNALS_PER_EVENT]
    }

    #[inline]
    pub fn read_index(&self) -> i64 {
        self.header.read_index.load(Ordering::Acquire)
    }

    #[inline]
    pub fn write_index(&self) -> i64 {
        self.header.write_index.load(Ordering::Acquire)
    }

    /// Take the next ring position and wait for its slot to be free.
    ///
    /// With more than [`IPC_SIGNALS_PER_EVENT`] records outstanding this
    /// blocks until the oldest one completes, so an unconsumed signal is
    /// never overwritten.
    pub fn claim(&self, policy: PollPolicy) -> Claim {
        let write_index = self.header.write_index.fetch_add(1, Ordering::AcqRel);
        let offset = offset_of(write_index);
        self.slot(offset).wait_cleared(policy);
        Claim {
            write_index,
            offset,
        }
    }

    /// Make record `write_index` visible to observers.
    ///
    /// Records publish strictly in claim order: this waits for `write_index - 1`
    /// to be published first. Only ever moves `read_index` forward by one.
    pub fn publish(&self, write_index: i64, policy: PollPolicy) {
        let expected = write_index - 1;
        poll_until(policy, || {
            self.header
                .read_index
                .compare_exchange(expected, write_index, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        });
    }

    /// The last published record, or `None` if nothing was ever recorded.
    pub fn observe(&self) -> Option<Observation> {
        let read_index = self.read_index();
        if read_index < 0 {
            return None;
        }
        Some(Observation {
            read_index,
            offset: offset_of(read_index),
        })
    }

    /// Non-blocking completion check of the last published record.
    pub fn status(&self) -> EventStatus {
        match self.observe() {
            Some(observation) if !self.is_complete(observation) => EventStatus::NotReady,
            _ => EventStatus::Ready,
        }
    }

    /// Whether the record seen in `observation` has completed.
    ///
    /// Once the ring has advanced a full lap past it, its slot has been
    /// reused, which can only happen after it was cleared.
    pub fn is_complete(&self, observation: Observation) -> bool {
        !self.slot(observation.offset).is_raised()
            || self.read_index() >= observation.read_index + RING
    }

    /// Block until the record seen in `observation` has completed.
    pub fn wait_complete(&self, observation: Observation, policy: PollPolicy) {
        poll_until(policy, || self.is_complete(observation));
    }
}

#[inline]
fn offset_of(index: i64) -> usize {
    index.rem_euclid(RING) as usize
}
