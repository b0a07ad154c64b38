//! Error taxonomy for the event and device API.

/// Errors returned by event, stream and IPC operations.
///
/// Every failing call is expected to leave the object it was called on
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// A malformed argument, e.g. a handle whose name is not NUL-terminated.
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// A shared resource could not be created or mapped.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The operation is not valid from the calling context (e.g. a process
    /// importing its own event handle).
    #[error("invalid context: {0}")]
    InvalidContext(String),
    /// A callback could not be attached to a stream.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    /// Allocation failed. Not produced by the event code itself, which
    /// aborts on allocation failure; kept so [`RuntimeError::name`] covers the
    /// whole code table.
    #[error("out of memory")]
    OutOfMemory,
    /// The queried work has not completed yet.
    #[error("not ready")]
    NotReady,
    /// The platform lacks the required facility, e.g. shared-memory events
    /// on a target without POSIX shared memory.
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl RuntimeError {
    /// Stable name of the error code, independent of the message.
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeError::InvalidValue(_) => "ErrorInvalidValue",
            RuntimeError::InvalidConfiguration(_) => "ErrorInvalidConfiguration",
            RuntimeError::InvalidContext(_) => "ErrorInvalidContext",
            RuntimeError::InvalidHandle(_) => "ErrorInvalidHandle",
            RuntimeError::OutOfMemory => "ErrorOutOfMemory",
            RuntimeError::NotReady => "ErrorNotReady",
            RuntimeError::NotSupported(_) => "ErrorNotSupported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_ignore_message() {
        assert_eq!(
            RuntimeError::InvalidContext("self import".into()).name(),
            RuntimeError::InvalidContext(String::new()).name()
        );
        assert_eq!(RuntimeError::NotReady.name(), "ErrorNotReady");
    }

    #[test]
    fn test_display_includes_message() {
        let err = RuntimeError::InvalidConfiguration("shm_open failed".into());
        assert_eq!(err.to_string(), "invalid configuration: shm_open failed");
    }
}
