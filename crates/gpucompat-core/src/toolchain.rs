//! The compiler toolchain seen by runtime compilation.

use crate::DeviceId;

/// A named header made available to `#include` during a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub source: String,
}

impl Header {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Everything a toolchain needs to compile one program.
#[derive(Debug, Clone, Copy)]
pub struct TranslationUnit<'a> {
    /// Program name, used for file names and diagnostics.
    pub name: &'a str,
    pub source: &'a str,
    pub headers: &'a [Header],
    pub device: DeviceId,
}

/// Output of a successful build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildArtifacts {
    /// Code object for the target device.
    pub binary: Vec<u8>,
    /// Compiler diagnostics, possibly empty.
    pub log: String,
    /// Mangled names of every symbol defined by the code object.
    pub lowered_names: Vec<String>,
}

/// A failed build. The log is what the user gets to see.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("build failed")]
pub struct BuildFailure {
    pub log: String,
}

impl BuildFailure {
    pub fn new(log: impl Into<String>) -> Self {
        Self { log: log.into() }
    }
}

/// Compiler, symbol lister and demangler for one device family.
pub trait Toolchain: Send + Sync {
    /// Whether programs can be built for `device`.
    fn supports_device(&self, device: DeviceId) -> bool {
        let _ = device;
        true
    }

    /// Compile `unit` with the fully assembled option list.
    fn build(
        &self,
        unit: &TranslationUnit<'_>,
        options: &[String],
    ) -> Result<BuildArtifacts, BuildFailure>;

    /// Demangle one symbol, `None` if it cannot be demangled.
    fn demangle(&self, mangled: &str) -> Option<String>;

    /// Demangle every symbol of a build, in order. `None` if any of them
    /// cannot be demangled.
    fn demangle_all(&self, mangled: &[String]) -> Option<Vec<String>> {
        mangled.iter().map(|m| self.demangle(m)).collect()
    }
}
