//! Devices and streams.
//!
//! The core never drives a device itself. It needs two things from the
//! underlying runtime: which device is current, and a queue that runs a
//! callback once all work enqueued before it has completed. [`Stream`] is
//! that queue.

use std::panic::AssertUnwindSafe;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::RuntimeError;

/// Ordinal of a device as seen by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DeviceId(pub i32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device {}", self.0)
    }
}

/// Callback run by a stream when the work enqueued ahead of it completes.
///
/// The argument is the completion status of that work.
pub type HostCallback = Box<dyn FnOnce(Result<(), RuntimeError>) + Send + 'static>;

/// An in-order asynchronous command queue.
pub trait Stream: Send + Sync {
    /// Device the stream submits to.
    fn device_id(&self) -> DeviceId;

    /// Enqueue `callback` behind all previously enqueued work.
    ///
    /// Fails with [`RuntimeError::InvalidHandle`] if the callback could not
    /// be attached; the callback is then dropped without running.
    fn enqueue_callback(&self, callback: HostCallback) -> Result<(), RuntimeError>;
}

/// A stream executed by a dedicated host thread.
///
/// Callbacks run one at a time in submission order. Useful as the fallback
/// queue when no device is present, and as a realistic asynchronous peer in
/// tests.
pub struct HostStream {
    device: DeviceId,
    sender: Mutex<Option<mpsc::Sender<HostCallback>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<Pending>,
}

#[derive(Default)]
struct Pending {
    count: Mutex<u64>,
    drained: Condvar,
}

impl HostStream {
    /// Spawn the worker thread for a new stream on `device`.
    pub fn new(device: DeviceId) -> Result<Self, RuntimeError> {
        let (sender, receiver) = mpsc::channel::<HostCallback>();
        let pending = Arc::new(Pending::default());

        let worker = {
            let pending = pending.clone();
            std::thread::Builder::new()
                .name(format!("gpucompat-stream-{}", device.0))
                .spawn(move || {
                    for callback in receiver {
                        let run = std::panic::catch_unwind(AssertUnwindSafe(move || callback(Ok(()))));
                        if run.is_err() {
                            tracing::warn!(device = device.0, "stream callback panicked");
                        }
                        let mut count = pending.count.lock();
                        *count -= 1;
                        if *count == 0 {
                            pending.drained.notify_all();
                        }
                    }
                })
                .map_err(|e| {
                    RuntimeError::InvalidConfiguration(format!("failed to spawn stream worker: {e}"))
                })?
        };

        Ok(Self {
            device,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            pending,
        })
    }

    /// Block until every callback enqueued so far has run.
    pub fn synchronize(&self) {
        let mut count = self.pending.count.lock();
        while *count != 0 {
            self.pending.drained.wait(&mut count);
        }
    }
}

impl Stream for HostStream {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn enqueue_callback(&self, callback: HostCallback) -> Result<(), RuntimeError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(RuntimeError::InvalidHandle("stream is shut down".into()));
        };

        *self.pending.count.lock() += 1;
        if sender.send(callback).is_err() {
            let mut count = self.pending.count.lock();
            *count -= 1;
            if *count == 0 {
                self.pending.drained.notify_all();
            }
            return Err(RuntimeError::InvalidHandle("stream worker exited".into()));
        }
        Ok(())
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once the queue is drained.
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::warn!(device = self.device.0, "stream worker panicked");
            }
        }
    }
}
