//! gpucompat-ipc: events that can be observed from another process.
//!
//! An [`IpcEvent`] owns a small named shared-memory segment. Recording the
//! event raises a slot in a ring of signal slots and arranges for the
//! recording stream to clear it on completion. Any process that imports the
//! exported [`IpcEventHandle`] maps the same segment and polls the ring.
//!
//! # Segment layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  magic | version | owners | owner device | owner pid | pad   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  read_index (i64, -1 until first record)                      │
//! │  write_index (i64)                                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  signals[IPC_SIGNALS_PER_EVENT] (i32, 0 = free)               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `write_index` hands out ring positions to recorders. `read_index` is only
//! ever moved from `w - 1` to `w` by compare-and-swap, which is the point at
//! which record `w` becomes visible to observers.

#![forbid(unsafe_op_in_unsafe_fn)]

mod event;
mod handle;
pub mod layout;
mod ring;
mod segment;

pub use event::{IpcEvent, IpcEventConfig};
pub use handle::IpcEventHandle;
pub use layout::{
    EventSegmentHeader, LayoutError, SignalSlot, IPC_HANDLE_SIZE, IPC_SIGNALS_PER_EVENT,
    SEGMENT_MAGIC, SEGMENT_VERSION,
};
pub use ring::{Claim, EventStatus, Observation, SignalRing};
pub use segment::{SegmentError, SharedSegment};
