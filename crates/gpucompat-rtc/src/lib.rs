//! gpucompat-rtc: runtime compilation.
//!
//! A [`ProgramStore`] owns compilation sessions. Each session collects a
//! source, its headers and a set of name expressions, is compiled once by a
//! [`Toolchain`](gpucompat_core::Toolchain), and then maps each name
//! expression to the mangled symbol the compiler emitted for it.
//!
//! Name expressions are resolved by planting a marker variable per
//! expression in the source, so the compiler instantiates it, and then
//! matching demangled symbols against the expression with a
//! [`SignaturePrefix`].

mod command;
mod config;
mod error;
mod name_expr;
mod options;
mod session;
mod store;

pub use command::{CommandToolchain, ToolError, ToolchainConfig};
pub use config::{RtcConfig, RuntimeVersion, BUILTIN_HEADER_NAME, BUILTIN_HEADER_SOURCE, DEFAULT_VERSION_OPTION};
pub use error::RtcError;
pub use name_expr::{
    strip_name_expression, without_whitespace, PrefixError, SignaturePrefix,
    KERNEL_DESCRIPTOR_MARKER,
};
pub use options::{assemble_options, rewrite_option, rtc_flags, version_flags, AssembledOptions};
pub use session::{NameExpression, ProgramHandle, ProgramSession, SessionState};
pub use store::{ProgramStore, DEFAULT_PROGRAM_NAME};
