//! Exportable event handles.

use gpucompat_core::RuntimeError;

use crate::layout::IPC_HANDLE_SIZE;

/// Opaque token naming an event's shared segment.
///
/// On the wire it is a fixed [`IPC_HANDLE_SIZE`]-byte blob holding a
/// NUL-terminated segment name, padded with NULs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcEventHandle {
    bytes: [u8; IPC_HANDLE_SIZE],
}

impl IpcEventHandle {
    /// Build a handle from a segment name.
    pub fn from_name(name: &str) -> Result<Self, RuntimeError> {
        if name.is_empty() || name.len() >= IPC_HANDLE_SIZE || name.contains('\0') {
            return Err(RuntimeError::InvalidValue(format!(
                "segment name {name:?} does not fit an event handle"
            )));
        }
        let mut bytes = [0u8; IPC_HANDLE_SIZE];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self { bytes })
    }

    /// Wrap raw bytes received from another process. Not validated until
    /// [`IpcEventHandle::name`] is called.
    pub fn from_bytes(bytes: [u8; IPC_HANDLE_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; IPC_HANDLE_SIZE] {
        &self.bytes
    }

    /// The segment name stored in the handle.
    pub fn name(&self) -> Result<&str, RuntimeError> {
        let len = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| RuntimeError::InvalidValue("event handle is not NUL-terminated".into()))?;
        if len == 0 {
            return Err(RuntimeError::InvalidValue("event handle is empty".into()));
        }
        std::str::from_utf8(&self.bytes[..len])
            .map_err(|_| RuntimeError::InvalidValue("event handle name is not UTF-8".into()))
    }
}

impl std::fmt::Debug for IpcEventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Ok(name) => f.debug_tuple("IpcEventHandle").field(&name).finish(),
            Err(_) => f.debug_tuple("IpcEventHandle").field(&"<invalid>").finish(),
        }
    }
}
