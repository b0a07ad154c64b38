//! Runtime-compilation configuration.

use gpucompat_core::Header;

/// Version reported to compiled programs and by [`crate::ProgramStore::version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl RuntimeVersion {
    pub const CURRENT: RuntimeVersion = RuntimeVersion {
        major: 1,
        minor: 0,
        patch: 0,
    };
}

impl std::fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Driver option carrying the runtime version, as accepted by clang.
pub const DEFAULT_VERSION_OPTION: &str = "--hip-version";

/// Name under which the builtin runtime header is made available.
pub const BUILTIN_HEADER_NAME: &str = "gpucompat_rtc_runtime.h";

/// Minimal device-side declarations force-included in rtc mode, so that
/// programs compile without the full runtime headers on the include path.
pub const BUILTIN_HEADER_SOURCE: &str = r#"#pragma once
#define __global__ __attribute__((global))
#define __device__ __attribute__((device))
#define __host__ __attribute__((host))
#define __shared__ __attribute__((shared))
#define __constant__ __attribute__((constant))
#define __forceinline__ inline __attribute__((always_inline))

typedef __SIZE_TYPE__ size_t;
typedef __PTRDIFF_TYPE__ ptrdiff_t;
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    pub version: RuntimeVersion,
    /// Option passed as `<option>=X.Y.Z` ahead of everything else. `None`
    /// leaves only the version defines, for drivers without such an option.
    pub version_option: Option<String>,
    /// Compile against the builtin header instead of the system runtime
    /// headers.
    pub rtc_mode: bool,
    /// Prepended to every program's headers in rtc mode.
    pub builtin_header: Option<Header>,
    pub language_standard: String,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            version: RuntimeVersion::CURRENT,
            version_option: Some(DEFAULT_VERSION_OPTION.into()),
            rtc_mode: true,
            builtin_header: Some(Header::new(BUILTIN_HEADER_NAME, BUILTIN_HEADER_SOURCE)),
            language_standard: "c++14".into(),
        }
    }
}
