//! Events observable across processes.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use gpucompat_core::{poll_until_bounded, DeviceId, PollPolicy, RuntimeError, Stream, WaitableFlag};
use parking_lot::Mutex;

use crate::handle::IpcEventHandle;
use crate::ring::EventStatus;
use crate::segment::{SegmentError, SharedSegment};

/// Configuration for an [`IpcEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcEventConfig {
    /// Backoff used by every wait on the signal ring.
    pub poll: PollPolicy,
    /// How many polls an importer spends waiting for the owner to finish
    /// initializing the segment.
    pub import_attempts: u32,
}

impl Default for IpcEventConfig {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            import_attempts: 1000,
        }
    }
}

/// An event whose completion can be observed by other processes.
///
/// The shared segment is created lazily by the first [`IpcEvent::record`] or
/// [`IpcEvent::export_handle`]. Record and stream-wait are serialized by a
/// per-event lock; [`IpcEvent::query`] only loads atomics.
pub struct IpcEvent {
    device: AtomicI32,
    config: IpcEventConfig,
    segment: OnceLock<Arc<SharedSegment>>,
    lock: Mutex<()>,
}

impl IpcEvent {
    pub fn new(device: DeviceId) -> Self {
        Self::with_config(device, IpcEventConfig::default())
    }

    pub fn with_config(device: DeviceId, config: IpcEventConfig) -> Self {
        Self {
            device: AtomicI32::new(device.0),
            config,
            segment: OnceLock::new(),
            lock: Mutex::new(()),
        }
    }

    /// Device the event belongs to. Importers adopt the owner's device.
    pub fn device_id(&self) -> DeviceId {
        DeviceId(self.device.load(Ordering::Relaxed))
    }

    pub fn config(&self) -> &IpcEventConfig {
        &self.config
    }

    /// The shared segment, if one has been created or imported.
    pub fn segment(&self) -> Option<&Arc<SharedSegment>> {
        self.segment.get()
    }

    /// Create the shared segment unless it already exists.
    pub fn create_segment_if_needed(&self) -> Result<&Arc<SharedSegment>, RuntimeError> {
        let _guard = self.lock.lock();
        self.ensure_segment()
    }

    /// Caller holds `self.lock`.
    fn ensure_segment(&self) -> Result<&Arc<SharedSegment>, RuntimeError> {
        if let Some(segment) = self.segment.get() {
            return Ok(segment);
        }
        let segment = SharedSegment::create(self.device_id()).map_err(creation_error)?;
        Ok(self.segment.get_or_init(|| Arc::new(segment)))
    }

    /// Non-blocking completion check.
    ///
    /// An event that was never recorded is ready.
    pub fn query(&self) -> EventStatus {
        match self.segment.get() {
            Some(segment) => segment.ring().status(),
            None => EventStatus::Ready,
        }
    }

    /// Block the calling thread until the last published record completes.
    pub fn synchronize(&self) {
        let Some(segment) = self.segment.get() else {
            return;
        };
        let ring = segment.ring();
        if let Some(observation) = ring.observe() {
            ring.wait_complete(observation, self.config.poll);
        }
    }

    /// Record the event on `stream`.
    ///
    /// The record is published to observers before this returns; it completes
    /// when `stream` runs the completion callback attached here.
    pub fn record(&self, stream: &dyn Stream) -> Result<(), RuntimeError> {
        let _guard = self.lock.lock();
        let segment = self.ensure_segment()?.clone();
        let ring = segment.ring();

        let claim = ring.claim(self.config.poll);
        let slot = ring.slot(claim.offset);
        slot.raise();
        segment
            .header()
            .owners_device_id
            .store(self.device_id().0, Ordering::Release);

        let callback_segment = segment.clone();
        let offset = claim.offset;
        let attached = stream.enqueue_callback(Box::new(move |status| {
            if let Err(e) = status {
                tracing::warn!(segment = %callback_segment.name(), "recorded work failed: {}", e);
            }
            callback_segment.ring().slot(offset).clear();
        }));

        if let Err(e) = attached {
            // Publish the claimed index anyway so later records are not
            // stuck behind it. The slot is clear, so it reads as complete.
            slot.clear();
            ring.publish(claim.write_index, self.config.poll);
            return Err(match e {
                RuntimeError::InvalidHandle(msg) => RuntimeError::InvalidHandle(msg),
                other => RuntimeError::InvalidHandle(other.to_string()),
            });
        }

        ring.publish(claim.write_index, self.config.poll);
        tracing::trace!(
            segment = %segment.name(),
            write_index = claim.write_index,
            "recorded ipc event"
        );
        Ok(())
    }

    /// Make all work enqueued on `stream` after this call wait for the last
    /// published record of this event.
    pub fn wait(&self, stream: &dyn Stream) -> Result<(), RuntimeError> {
        let _guard = self.lock.lock();
        let Some(segment) = self.segment.get() else {
            return Ok(());
        };
        let Some(observation) = segment.ring().observe() else {
            return Ok(());
        };
        if segment.ring().is_complete(observation) {
            return Ok(());
        }

        let segment = segment.clone();
        let policy = self.config.poll;
        stream
            .enqueue_callback(Box::new(move |_| {
                segment.ring().wait_complete(observation, policy);
            }))
            .map_err(|e| match e {
                RuntimeError::InvalidHandle(msg) => RuntimeError::InvalidHandle(msg),
                other => RuntimeError::InvalidHandle(other.to_string()),
            })
    }

    /// Export a handle other processes can open.
    pub fn export_handle(&self) -> Result<IpcEventHandle, RuntimeError> {
        let _guard = self.lock.lock();
        let segment = self.ensure_segment()?;
        let header = segment.header();
        header
            .owners_device_id
            .store(self.device_id().0, Ordering::Release);
        header
            .owners_process_id
            .store(std::process::id() as i32, Ordering::Release);
        IpcEventHandle::from_name(segment.name())
    }

    /// Open a handle exported by another process.
    ///
    /// Fails with [`RuntimeError::InvalidContext`] when the handle was
    /// exported by the calling process.
    pub fn open_handle(handle: &IpcEventHandle, config: IpcEventConfig) -> Result<Self, RuntimeError> {
        let name = handle.name()?;
        let segment = SharedSegment::open(name).map_err(import_error)?;
        let header = segment.header();

        if !poll_until_bounded(config.poll, config.import_attempts, || header.is_initialized()) {
            return Err(RuntimeError::InvalidValue(format!(
                "event segment {name} was never initialized"
            )));
        }
        header
            .validate()
            .map_err(|e| RuntimeError::InvalidValue(SegmentError::from(e).to_string()))?;

        if header.owner_process() == std::process::id() as i32 {
            return Err(RuntimeError::InvalidContext(
                "event handle was exported by this process".into(),
            ));
        }

        segment.attach();
        let device = header.owner_device();
        tracing::debug!(name, device = device.0, "opened ipc event handle");

        let event = Self::with_config(device, config);
        // A fresh OnceLock cannot be occupied.
        let _ = event.segment.set(Arc::new(segment));
        Ok(event)
    }
}

fn creation_error(e: SegmentError) -> RuntimeError {
    match e {
        SegmentError::Unsupported => RuntimeError::NotSupported(e.to_string()),
        e => RuntimeError::InvalidConfiguration(e.to_string()),
    }
}

fn import_error(e: SegmentError) -> RuntimeError {
    match e {
        SegmentError::Unsupported => RuntimeError::NotSupported(e.to_string()),
        e => RuntimeError::InvalidValue(e.to_string()),
    }
}

impl std::fmt::Debug for IpcEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcEvent")
            .field("device", &self.device_id())
            .field("segment", &self.segment.get().map(|s| s.name()))
            .finish()
    }
}
