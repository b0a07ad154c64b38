//! gpucompat-testkit: test doubles for the device-facing collaborators.
//!
//! - [`ManualStream`]: a stream whose callbacks only run when the test says so,
//!   which makes "recorded but not yet complete" states reproducible.
//! - [`FailingStream`]: a stream that refuses every callback.
//! - [`FakeToolchain`]: a compiler that "compiles" nullary `__global__`
//!   kernels found in the source and serves any extra symbols the test
//!   registers.
//!
//! # Usage
//!
//! ```ignore
//! let stream = ManualStream::new(DeviceId(0));
//! event.record(&stream)?;
//! assert_eq!(event.query(), EventStatus::NotReady);
//! stream.complete_all();
//! assert_eq!(event.query(), EventStatus::Ready);
//! ```

use std::collections::VecDeque;

use gpucompat_core::{
    BuildArtifacts, BuildFailure, DeviceId, Header, HostCallback, RuntimeError, Stream, Toolchain,
    TranslationUnit,
};
use parking_lot::Mutex;

// ============================================================================
// Streams
// ============================================================================

/// A stream driven by the test.
pub struct ManualStream {
    device: DeviceId,
    queue: Mutex<VecDeque<HostCallback>>,
}

impl ManualStream {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of callbacks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run the oldest callback successfully. Returns false if none was queued.
    pub fn complete_next(&self) -> bool {
        self.finish_next(Ok(()))
    }

    /// Run the oldest callback with a failure status.
    pub fn fail_next(&self, error: RuntimeError) -> bool {
        self.finish_next(Err(error))
    }

    /// Run every queued callback, including ones queued while draining.
    pub fn complete_all(&self) {
        while self.complete_next() {}
    }

    fn finish_next(&self, status: Result<(), RuntimeError>) -> bool {
        // Callbacks may block or enqueue more work, so run them unlocked.
        let callback = self.queue.lock().pop_front();
        match callback {
            Some(callback) => {
                callback(status);
                true
            }
            None => false,
        }
    }
}

impl Stream for ManualStream {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn enqueue_callback(&self, callback: HostCallback) -> Result<(), RuntimeError> {
        self.queue.lock().push_back(callback);
        Ok(())
    }
}

/// A stream that cannot accept callbacks.
pub struct FailingStream {
    device: DeviceId,
}

impl FailingStream {
    pub fn new(device: DeviceId) -> Self {
        Self { device }
    }
}

impl Stream for FailingStream {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn enqueue_callback(&self, _callback: HostCallback) -> Result<(), RuntimeError> {
        Err(RuntimeError::InvalidHandle("callback rejected".into()))
    }
}

// ============================================================================
// Toolchain
// ============================================================================

/// One call to [`FakeToolchain::build`], as seen by the toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBuild {
    pub name: String,
    pub source: String,
    pub headers: Vec<Header>,
    pub options: Vec<String>,
    pub device: DeviceId,
}

/// A toolchain double.
///
/// Every nullary `__global__ void name()` kernel in the source yields the
/// symbol `_Z<len><name>v` plus its kernel descriptor `_Z<len><name>v.kd`.
/// Additional `(mangled, demangled)` pairs can be registered for things the
/// scanner cannot see, such as template instantiations.
#[derive(Default)]
pub struct FakeToolchain {
    symbols: Mutex<Vec<(String, String)>>,
    failure: Mutex<Option<String>>,
    warning: Mutex<Option<String>>,
    unsupported: Mutex<Vec<DeviceId>>,
    broken_demangler: Mutex<bool>,
    builds: Mutex<Vec<RecordedBuild>>,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `mangled` from every build and demangle it as `demangled`.
    pub fn with_symbol(self, mangled: &str, demangled: &str) -> Self {
        self.symbols
            .lock()
            .push((mangled.to_owned(), demangled.to_owned()));
        self
    }

    /// Fail every build with `log`.
    pub fn failing(self, log: &str) -> Self {
        *self.failure.lock() = Some(log.to_owned());
        self
    }

    /// Succeed with `log` as compiler diagnostics.
    pub fn with_warning(self, log: &str) -> Self {
        *self.warning.lock() = Some(log.to_owned());
        self
    }

    /// Reject programs for `device`.
    pub fn without_device(self, device: DeviceId) -> Self {
        self.unsupported.lock().push(device);
        self
    }

    /// Make every demangle call fail.
    pub fn with_broken_demangler(self) -> Self {
        *self.broken_demangler.lock() = true;
        self
    }

    /// Stop failing builds.
    pub fn heal(&self) {
        self.failure.lock().take();
    }

    pub fn builds(&self) -> Vec<RecordedBuild> {
        self.builds.lock().clone()
    }

    pub fn last_build(&self) -> Option<RecordedBuild> {
        self.builds.lock().last().cloned()
    }
}

impl Toolchain for FakeToolchain {
    fn supports_device(&self, device: DeviceId) -> bool {
        !self.unsupported.lock().contains(&device)
    }

    fn build(
        &self,
        unit: &TranslationUnit<'_>,
        options: &[String],
    ) -> Result<BuildArtifacts, BuildFailure> {
        self.builds.lock().push(RecordedBuild {
            name: unit.name.to_owned(),
            source: unit.source.to_owned(),
            headers: unit.headers.to_vec(),
            options: options.to_vec(),
            device: unit.device,
        });

        if let Some(log) = self.failure.lock().clone() {
            return Err(BuildFailure::new(log));
        }

        let mut lowered_names = Vec::new();
        for kernel in nullary_kernels(unit.source) {
            let mangled = format!("_Z{}{}v", kernel.len(), kernel);
            lowered_names.push(format!("{mangled}.kd"));
            lowered_names.push(mangled);
        }
        lowered_names.extend(self.symbols.lock().iter().map(|(mangled, _)| mangled.clone()));

        let mut binary = b"\x7fFAKE".to_vec();
        binary.extend_from_slice(unit.name.as_bytes());

        Ok(BuildArtifacts {
            binary,
            log: self.warning.lock().clone().unwrap_or_default(),
            lowered_names,
        })
    }

    fn demangle(&self, mangled: &str) -> Option<String> {
        if *self.broken_demangler.lock() {
            return None;
        }
        if let Some((_, demangled)) = self.symbols.lock().iter().find(|(m, _)| m == mangled) {
            return Some(demangled.clone());
        }
        let (base, descriptor) = match mangled.strip_suffix(".kd") {
            Some(base) => (base, true),
            None => (mangled, false),
        };
        let name = demangle_nullary(base)?;
        Some(if descriptor {
            format!("{name}() (.kd)")
        } else {
            format!("{name}()")
        })
    }
}

/// Names of `__global__ void name()` definitions.
fn nullary_kernels(source: &str) -> Vec<&str> {
    let mut kernels = Vec::new();
    let mut rest = source;
    while let Some(at) = rest.find("__global__") {
        rest = &rest[at + "__global__".len()..];
        let Some(after_void) = rest.trim_start().strip_prefix("void") else {
            continue;
        };
        let after_void_trimmed = after_void.trim_start();
        if after_void_trimmed.len() == after_void.len() {
            // `voidfoo`, not a return type.
            continue;
        }
        let ident_len = after_void_trimmed
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after_void_trimmed.len());
        let ident = &after_void_trimmed[..ident_len];
        let params = after_void_trimmed[ident_len..].trim_start();
        let nullary = params
            .strip_prefix('(')
            .map(|p| p.trim_start().starts_with(')'))
            .unwrap_or(false);
        if !ident.is_empty() && nullary {
            kernels.push(ident);
        }
    }
    kernels
}

/// Inverse of the `_Z<len><name>v` scheme used above.
fn demangle_nullary(mangled: &str) -> Option<&str> {
    let body = mangled.strip_prefix("_Z")?.strip_suffix('v')?;
    let digits = body.find(|c: char| !c.is_ascii_digit())?;
    let len: usize = body[..digits].parse().ok()?;
    let name = &body[digits..];
    (name.len() == len).then_some(name)
}
