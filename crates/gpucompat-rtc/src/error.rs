//! Error taxonomy of runtime compilation.

/// Errors returned by [`crate::ProgramStore`] operations.
///
/// `OutOfMemory`, `NoLoweredNamesBeforeCompilation` and `InternalError` are
/// never produced here; they keep [`RtcError::as_str`] covering the whole
/// code table. A lowered-name query before compilation reports
/// `NameExpressionNotValid`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RtcError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("program creation failed: {0}")]
    ProgramCreationFailure(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid program")]
    InvalidProgram,
    /// An option that cannot be passed to the compiler, such as one with an
    /// embedded NUL.
    #[error("invalid option: {0}")]
    InvalidOption(String),
    /// The build failed; the diagnostics are in the program log.
    #[error("compilation failed")]
    Compilation,
    #[error("builtin operation failed: {0}")]
    BuiltinOperationFailure(String),
    #[error("name expressions cannot be added after compilation")]
    NoNameExpressionsAfterCompilation,
    #[error("lowered names are not available before compilation")]
    NoLoweredNamesBeforeCompilation,
    #[error("name expression not valid: {0}")]
    NameExpressionNotValid(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl RtcError {
    /// Stable name of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            RtcError::OutOfMemory => "RTC_ERROR_OUT_OF_MEMORY",
            RtcError::ProgramCreationFailure(_) => "RTC_ERROR_PROGRAM_CREATION_FAILURE",
            RtcError::InvalidInput(_) => "RTC_ERROR_INVALID_INPUT",
            RtcError::InvalidProgram => "RTC_ERROR_INVALID_PROGRAM",
            RtcError::InvalidOption(_) => "RTC_ERROR_INVALID_OPTION",
            RtcError::Compilation => "RTC_ERROR_COMPILATION",
            RtcError::BuiltinOperationFailure(_) => "RTC_ERROR_BUILTIN_OPERATION_FAILURE",
            RtcError::NoNameExpressionsAfterCompilation => {
                "RTC_ERROR_NO_NAME_EXPRESSIONS_AFTER_COMPILATION"
            }
            RtcError::NoLoweredNamesBeforeCompilation => {
                "RTC_ERROR_NO_LOWERED_NAMES_BEFORE_COMPILATION"
            }
            RtcError::NameExpressionNotValid(_) => "RTC_ERROR_NAME_EXPRESSION_NOT_VALID",
            RtcError::InternalError(_) => "RTC_ERROR_INTERNAL_ERROR",
        }
    }
}
