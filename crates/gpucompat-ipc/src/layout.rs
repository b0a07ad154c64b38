//! Shared-memory layout of an IPC event segment.
//!
//! Everything in the segment is an atomic so that a mapping can be shared
//! between processes without any further synchronization.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};

use gpucompat_core::{DeviceId, WaitableFlag};

/// Number of signal slots per event, i.e. how many records may be in flight.
pub const IPC_SIGNALS_PER_EVENT: usize = 32;

/// Size in bytes of an exported event handle.
pub const IPC_HANDLE_SIZE: usize = 64;

/// `"GCEV"` little-endian.
pub const SEGMENT_MAGIC: u32 = u32::from_le_bytes(*b"GCEV");

pub const SEGMENT_VERSION: u32 = 1;

/// One ring cell. Zero means free, anything else means a record is pending.
#[repr(transparent)]
#[derive(Debug)]
pub struct SignalSlot(AtomicI32);

impl SignalSlot {
    pub const fn new() -> Self {
        Self(AtomicI32::new(0))
    }
}

impl Default for SignalSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitableFlag for SignalSlot {
    #[inline]
    fn raise(&self) {
        self.0.store(1, Ordering::Release);
    }

    #[inline]
    fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    #[inline]
    fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }
}

/// Header at offset 0 of every event segment.
#[repr(C)]
#[derive(Debug)]
pub struct EventSegmentHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    /// Number of attached mappings across all processes.
    pub owners: AtomicU32,
    pub owners_device_id: AtomicI32,
    pub owners_process_id: AtomicI32,
    _pad: AtomicU32,
    /// Last published record, -1 before the first one.
    pub read_index: AtomicI64,
    /// Next ring position to hand out.
    pub write_index: AtomicI64,
    pub signals: [SignalSlot; IPC_SIGNALS_PER_EVENT],
}

const _: () = assert!(std::mem::size_of::<EventSegmentHeader>() == 40 + 4 * IPC_SIGNALS_PER_EVENT);
const _: () = assert!(std::mem::align_of::<EventSegmentHeader>() == 8);

impl EventSegmentHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// A header living in ordinary process memory, not yet initialized.
    pub fn detached() -> Self {
        Self {
            magic: AtomicU32::new(0),
            version: AtomicU32::new(0),
            owners: AtomicU32::new(0),
            owners_device_id: AtomicI32::new(0),
            owners_process_id: AtomicI32::new(0),
            _pad: AtomicU32::new(0),
            read_index: AtomicI64::new(0),
            write_index: AtomicI64::new(0),
            signals: std::array::from_fn(|_| SignalSlot::new()),
        }
    }

    /// Put a freshly created segment into its initial state.
    ///
    /// `magic` is stored last with release ordering; a reader that observes
    /// it also observes the rest of the initialization.
    pub fn initialize(&self, device: DeviceId, process_id: i32) {
        self.owners.store(1, Ordering::Relaxed);
        self.owners_device_id.store(device.0, Ordering::Relaxed);
        self.owners_process_id.store(process_id, Ordering::Relaxed);
        self.read_index.store(-1, Ordering::Relaxed);
        self.write_index.store(0, Ordering::Relaxed);
        for slot in &self.signals {
            slot.clear();
        }
        self.version.store(SEGMENT_VERSION, Ordering::Relaxed);
        self.magic.store(SEGMENT_MAGIC, Ordering::Release);
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.magic.load(Ordering::Acquire) != 0
    }

    /// Check that the segment was written by a compatible layout.
    pub fn validate(&self) -> Result<(), LayoutError> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != SEGMENT_MAGIC {
            return Err(LayoutError::BadMagic { found: magic });
        }
        let version = self.version.load(Ordering::Relaxed);
        if version != SEGMENT_VERSION {
            return Err(LayoutError::UnsupportedVersion { found: version });
        }
        Ok(())
    }

    #[inline]
    pub fn owner_device(&self) -> DeviceId {
        DeviceId(self.owners_device_id.load(Ordering::Acquire))
    }

    #[inline]
    pub fn owner_process(&self) -> i32 {
        self.owners_process_id.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("bad segment magic {found:#010x}")]
    BadMagic { found: u32 },
    #[error("unsupported segment version {found}")]
    UnsupportedVersion { found: u32 },
}
