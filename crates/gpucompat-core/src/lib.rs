//! gpucompat-core: pieces shared by the IPC event and runtime-compilation crates.
//!
//! - [`RuntimeError`]: the error taxonomy of the device/event API.
//! - [`Stream`]: the asynchronous command queue the core enqueues completion
//!   callbacks on. [`HostStream`] is a thread-backed implementation.
//! - [`Toolchain`]: the compiler runtime compilation drives.
//! - [`WaitableFlag`] and [`PollPolicy`]: how blocking waits are expressed.
//!   Peers can live in separate processes with nothing but mapped memory in
//!   common, so every wait is a poll loop with an injectable backoff.

#![forbid(unsafe_op_in_unsafe_fn)]

mod device;
mod error;
mod toolchain;
mod wait;

pub use device::{DeviceId, HostCallback, HostStream, Stream};
pub use error::RuntimeError;
pub use toolchain::{BuildArtifacts, BuildFailure, Header, Toolchain, TranslationUnit};
pub use wait::{poll_until, poll_until_bounded, PollPolicy, WaitableFlag};
