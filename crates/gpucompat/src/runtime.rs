//! The runtime context.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use gpucompat_core::{DeviceId, Header, RuntimeError, Stream, Toolchain};
use gpucompat_ipc::{IpcEvent, IpcEventHandle};
use gpucompat_rtc::{CommandToolchain, ProgramHandle, ProgramStore, RtcError};

use crate::config::RuntimeConfig;

/// Owns the configuration, the current device and the program store.
///
/// Programs live as long as the runtime: dropping it destroys every program
/// that was not destroyed explicitly. IPC events are owned by the caller.
pub struct Runtime {
    config: RuntimeConfig,
    device: AtomicI32,
    programs: ProgramStore,
}

impl Runtime {
    /// A runtime that compiles with the configured external toolchain.
    pub fn new(config: RuntimeConfig) -> Self {
        let toolchain = Arc::new(CommandToolchain::new(config.toolchain.clone()));
        Self::with_toolchain(config, toolchain)
    }

    pub fn with_toolchain(config: RuntimeConfig, toolchain: Arc<dyn Toolchain>) -> Self {
        let programs = ProgramStore::new(config.rtc.clone(), toolchain);
        tracing::debug!(version = %config.rtc.version, "runtime initialized");
        Self {
            config,
            device: AtomicI32::new(0),
            programs,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Device new events and programs are bound to.
    pub fn device(&self) -> DeviceId {
        DeviceId(self.device.load(Ordering::Relaxed))
    }

    pub fn set_device(&self, device: DeviceId) -> Result<(), RuntimeError> {
        if device.0 < 0 {
            return Err(RuntimeError::InvalidValue(format!("invalid device {device}")));
        }
        self.device.store(device.0, Ordering::Relaxed);
        Ok(())
    }

    // ========================================================================
    // IPC events
    // ========================================================================

    /// An interprocess event on the current device.
    pub fn create_ipc_event(&self) -> IpcEvent {
        IpcEvent::with_config(self.device(), self.config.ipc)
    }

    pub fn ipc_get_event_handle(&self, event: &IpcEvent) -> Result<IpcEventHandle, RuntimeError> {
        event.export_handle()
    }

    pub fn ipc_open_event_handle(&self, handle: &IpcEventHandle) -> Result<IpcEvent, RuntimeError> {
        IpcEvent::open_handle(handle, self.config.ipc)
    }

    pub fn event_record(&self, event: &IpcEvent, stream: &dyn Stream) -> Result<(), RuntimeError> {
        event.record(stream)
    }

    pub fn event_wait(&self, event: &IpcEvent, stream: &dyn Stream) -> Result<(), RuntimeError> {
        event.wait(stream)
    }

    /// `Err(NotReady)` while the last record is outstanding.
    pub fn event_query(&self, event: &IpcEvent) -> Result<(), RuntimeError> {
        event.query().into_result()
    }

    pub fn event_synchronize(&self, event: &IpcEvent) {
        event.synchronize()
    }

    // ========================================================================
    // Runtime compilation
    // ========================================================================

    pub fn programs(&self) -> &ProgramStore {
        &self.programs
    }

    /// Create a program on the current device.
    pub fn create_program(
        &self,
        source: &str,
        name: Option<&str>,
        headers: &[Header],
    ) -> Result<ProgramHandle, RtcError> {
        let sources: Vec<&str> = headers.iter().map(|h| h.source.as_str()).collect();
        let names: Vec<&str> = headers.iter().map(|h| h.name.as_str()).collect();
        let count = i32::try_from(headers.len())
            .map_err(|_| RtcError::InvalidInput(format!("too many headers: {}", headers.len())))?;
        self.programs
            .create_program(source, name, count, Some(sources.as_slice()), Some(names.as_slice()), self.device())
    }

    /// `(major, minor)` of the runtime-compilation interface.
    pub fn rtc_version(&self) -> (u32, u32) {
        self.programs.version()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.programs.clear();
        tracing::debug!("runtime torn down");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("device", &self.device())
            .field("programs", &self.programs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucompat_testkit::FakeToolchain;

    fn runtime() -> Runtime {
        Runtime::with_toolchain(RuntimeConfig::default(), Arc::new(FakeToolchain::new()))
    }

    #[test]
    fn test_set_device() {
        let runtime = runtime();
        assert_eq!(runtime.device(), DeviceId(0));
        runtime.set_device(DeviceId(2)).unwrap();
        assert_eq!(runtime.create_ipc_event().device_id(), DeviceId(2));
        assert!(matches!(
            runtime.set_device(DeviceId(-1)),
            Err(RuntimeError::InvalidValue(_))
        ));
        assert_eq!(runtime.device(), DeviceId(2));
    }

    #[test]
    fn test_programs_bound_to_current_device() {
        let toolchain = Arc::new(FakeToolchain::new());
        let runtime = Runtime::with_toolchain(RuntimeConfig::default(), toolchain.clone());
        runtime.set_device(DeviceId(1)).unwrap();

        let headers = [Header::new("n.h", "#define N 4")];
        let program = runtime.create_program("__global__ void k(){}", None, &headers).unwrap();
        runtime.programs().compile_program::<&str>(program, &[]).unwrap();

        let build = toolchain.last_build().unwrap();
        assert_eq!(build.device, DeviceId(1));
        assert_eq!(build.headers.last(), Some(&headers[0]));
    }

    #[test]
    fn test_event_query_reports_not_ready() {
        let runtime = runtime();
        let stream = gpucompat_testkit::ManualStream::new(runtime.device());
        let event = runtime.create_ipc_event();
        assert_eq!(runtime.event_query(&event), Ok(()));

        runtime.event_record(&event, &stream).unwrap();
        assert_eq!(runtime.event_query(&event), Err(RuntimeError::NotReady));
        stream.complete_all();
        assert_eq!(runtime.event_query(&event), Ok(()));
        runtime.event_synchronize(&event);
    }
}
