//! Runtime configuration.

use std::time::Duration;

use gpucompat_core::{PollPolicy, RuntimeError};
use gpucompat_ipc::IpcEventConfig;
use gpucompat_rtc::{RtcConfig, ToolchainConfig};

/// Poll interval for event waits, in microseconds. `0` spins.
pub const ENV_POLL_US: &str = "GPUCOMPAT_POLL_US";
/// `0`, `false` or `off` compiles against the system runtime headers.
pub const ENV_RTC_MODE: &str = "GPUCOMPAT_RTC_MODE";
/// Compiler used by [`gpucompat_rtc::CommandToolchain`].
pub const ENV_CXX: &str = "GPUCOMPAT_CXX";
/// Option carrying the runtime version to the compiler. Empty passes only
/// the version defines.
pub const ENV_VERSION_OPTION: &str = "GPUCOMPAT_VERSION_OPTION";

/// Everything a [`crate::Runtime`] is configured with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub ipc: IpcEventConfig,
    pub rtc: RtcConfig,
    pub toolchain: ToolchainConfig,
}

impl RuntimeConfig {
    /// Defaults overlaid with the `GPUCOMPAT_*` environment variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `var`.
    pub fn overlay(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, RuntimeError> {
        if let Some(value) = var(ENV_POLL_US) {
            let micros: u64 = value.trim().parse().map_err(|_| {
                RuntimeError::InvalidValue(format!("{ENV_POLL_US}={value:?} is not a number"))
            })?;
            self.ipc.poll = match micros {
                0 => PollPolicy::Spin,
                n => PollPolicy::Constant(Duration::from_micros(n)),
            };
        }

        if let Some(value) = var(ENV_RTC_MODE) {
            self.rtc.rtc_mode = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                _ => {
                    return Err(RuntimeError::InvalidValue(format!(
                        "{ENV_RTC_MODE}={value:?} is not a boolean"
                    )))
                }
            };
        }

        if let Some(value) = var(ENV_CXX).filter(|v| !v.trim().is_empty()) {
            self.toolchain.compiler = value;
        }

        if let Some(value) = var(ENV_VERSION_OPTION) {
            let value = value.trim();
            self.rtc.version_option = (!value.is_empty()).then(|| value.to_owned());
        }

        tracing::debug!(config = ?self, "runtime configuration");
        Ok(self)
    }
}
