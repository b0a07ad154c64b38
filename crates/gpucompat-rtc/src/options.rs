//! Compiler option assembly.
//!
//! The final command line is, in order: version identification, the rtc
//! mode flags, then the caller's options after legacy spellings have been
//! rewritten.

use crate::config::RtcConfig;

/// Accepted for compatibility and ignored.
const DROPPED_OPTIONS: &[&str] = &["-rtc-pch"];

const ARCH_ALIAS: &str = "--gpu-architecture=";
const ARCH_CANONICAL: &str = "--offload-arch=";

/// Result of [`assemble_options`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledOptions {
    pub options: Vec<String>,
    /// Notes for the program log about rewritten or dropped options.
    pub notes: Vec<String>,
}

pub fn version_flags(config: &RtcConfig) -> Vec<String> {
    let v = config.version;
    let mut flags = Vec::with_capacity(4);
    if let Some(option) = config.version_option.as_deref().filter(|o| !o.is_empty()) {
        flags.push(format!("{option}={v}"));
    }
    flags.extend([
        format!("-DGPUCOMPAT_VERSION_MAJOR={}", v.major),
        format!("-DGPUCOMPAT_VERSION_MINOR={}", v.minor),
        format!("-DGPUCOMPAT_VERSION_PATCH={}", v.patch),
    ]);
    flags
}

pub fn rtc_flags(config: &RtcConfig) -> Vec<String> {
    if !config.rtc_mode {
        return Vec::new();
    }
    let mut flags = vec!["-D__GPUCOMPAT_RTC__".to_owned()];
    if let Some(header) = &config.builtin_header {
        flags.push("-include".to_owned());
        flags.push(header.name.clone());
    }
    flags.push(format!("-std={}", config.language_standard));
    flags.push("-nogpuinc".to_owned());
    if cfg!(windows) {
        flags.extend(
            ["-target", "x86_64-pc-windows-msvc", "-fms-extensions", "-fms-compatibility"]
                .map(str::to_owned),
        );
    }
    flags
}

/// Rewrite one caller option. `None` drops it.
pub fn rewrite_option(option: &str) -> Option<String> {
    let option = option.trim();
    if option.is_empty() || DROPPED_OPTIONS.contains(&option) {
        return None;
    }
    if let Some(arch) = option.strip_prefix(ARCH_ALIAS) {
        return Some(format!("{ARCH_CANONICAL}{arch}"));
    }
    Some(option.to_owned())
}

/// Build the full option list for one compilation.
pub fn assemble_options<S: AsRef<str>>(config: &RtcConfig, user: &[S]) -> AssembledOptions {
    let mut assembled = AssembledOptions {
        options: version_flags(config),
        notes: Vec::new(),
    };
    assembled.options.extend(rtc_flags(config));

    for option in user {
        let option = option.as_ref();
        match rewrite_option(option) {
            Some(rewritten) => {
                if rewritten != option.trim() {
                    assembled
                        .notes
                        .push(format!("note: option '{option}' rewritten as '{rewritten}'"));
                }
                assembled.options.push(rewritten);
            }
            None if !option.trim().is_empty() => {
                assembled
                    .notes
                    .push(format!("warning: option '{option}' is no longer supported and was ignored"));
            }
            None => {}
        }
    }
    assembled
}
