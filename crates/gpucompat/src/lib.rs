//! gpucompat: a GPU-compute compatibility runtime core.
//!
//! Two subsystems sit behind one [`Runtime`]:
//!
//! - **IPC events** ([`IpcEvent`]): events backed by a shared-memory signal
//!   ring, exportable as a 64-byte [`IpcEventHandle`] and observable from
//!   other processes.
//! - **Runtime compilation** ([`ProgramStore`]): compile sessions with
//!   name-expression registration and lowering to mangled symbols.
//!
//! # Example
//!
//! ```no_run
//! use gpucompat::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Runtime::new(RuntimeConfig::from_env()?);
//! let stream = HostStream::new(runtime.device())?;
//!
//! let event = runtime.create_ipc_event();
//! runtime.event_record(&event, &stream)?;
//! let handle = runtime.ipc_get_event_handle(&event)?;
//! // ship `handle.as_bytes()` to another process
//! runtime.event_synchronize(&event);
//!
//! let programs = runtime.programs();
//! let program = runtime.create_program("__global__ void k(){}", Some("k.cu"), &[])?;
//! programs.add_name_expression(program, "k")?;
//! programs.compile_program(program, &["-O3"])?;
//! let symbol = programs.lowered_name(program, "k")?;
//! # let _ = (handle, symbol);
//! # Ok(())
//! # }
//! ```

mod config;
mod runtime;

pub use config::RuntimeConfig;
pub use runtime::Runtime;

pub use gpucompat_core::{
    DeviceId, Header, HostStream, PollPolicy, RuntimeError, Stream, Toolchain, WaitableFlag,
};
pub use gpucompat_ipc::{
    EventStatus, IpcEvent, IpcEventConfig, IpcEventHandle, IPC_HANDLE_SIZE, IPC_SIGNALS_PER_EVENT,
};
pub use gpucompat_rtc::{
    CommandToolchain, ProgramHandle, ProgramStore, RtcConfig, RtcError, RuntimeVersion,
    ToolchainConfig,
};

/// The types most callers need.
pub mod prelude {
    pub use crate::{
        DeviceId, EventStatus, HostStream, IpcEvent, IpcEventHandle, ProgramHandle, ProgramStore,
        RtcError, Runtime, RuntimeConfig, RuntimeError, Stream,
    };
}
