//! A [`Toolchain`] that runs an external compiler.
//!
//! Sources and headers are written to a scratch directory, the compiler
//! produces a device code object, `nm` lists its defined symbols and
//! `c++filt` demangles them, one process per batch.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::process::{Command, Output, Stdio};

use gpucompat_core::{BuildArtifacts, BuildFailure, Toolchain, TranslationUnit};
use parking_lot::Mutex;
use tempfile::TempDir;

/// External tools used by [`CommandToolchain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainConfig {
    pub compiler: String,
    /// Inserted before the assembled options.
    pub base_args: Vec<String>,
    pub nm: String,
    pub cxxfilt: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            compiler: "clang++".into(),
            base_args: ["-x", "hip", "--offload-device-only", "-c"]
                .map(str::to_owned)
                .to_vec(),
            nm: "llvm-nm".into(),
            cxxfilt: "llvm-cxxfilt".into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{tool} exited with {status}: {stderr}")]
    Subprocess {
        tool: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("header name {0:?} escapes the build directory")]
    HeaderPath(String),
}

pub struct CommandToolchain {
    config: ToolchainConfig,
    demangled: Mutex<HashMap<String, String>>,
}

impl CommandToolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        Self {
            config,
            demangled: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    fn compile(&self, unit: &TranslationUnit<'_>, options: &[String]) -> Result<BuildArtifacts, BuildFailure> {
        let dir = tempfile::Builder::new()
            .prefix("gpucompat-rtc-")
            .tempdir()
            .map_err(|e| BuildFailure::new(format!("unable to create build directory: {e}")))?;

        let source = write_inputs(&dir, unit).map_err(|e| BuildFailure::new(e.to_string()))?;
        let object = dir.path().join("program.o");

        let mut command = Command::new(&self.config.compiler);
        command
            .current_dir(dir.path())
            .args(&self.config.base_args)
            .args(options)
            .arg("-I")
            .arg(dir.path())
            .arg(&source)
            .arg("-o")
            .arg(&object);

        let output = run(&mut command, None).map_err(|e| BuildFailure::new(e.to_string()))?;
        let log = decode(&output.stderr);
        if !output.status.success() {
            return Err(BuildFailure::new(log));
        }

        let binary = std::fs::read(&object)
            .map_err(|e| BuildFailure::new(format!("{log}unable to read code object: {e}")))?;
        let lowered_names = self
            .defined_symbols(&object)
            .map_err(|e| BuildFailure::new(format!("{log}{e}")))?;

        tracing::debug!(
            program = unit.name,
            bytes = binary.len(),
            symbols = lowered_names.len(),
            "compiled with {}",
            self.config.compiler
        );
        Ok(BuildArtifacts {
            binary,
            log,
            lowered_names,
        })
    }

    fn defined_symbols(&self, object: &Path) -> Result<Vec<String>, ToolError> {
        let mut command = Command::new(&self.config.nm);
        command
            .arg("--defined-only")
            .arg("--just-symbol-name")
            .arg(object);
        let output = checked(&self.config.nm, run(&mut command, None)?)?;
        Ok(decode(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// One line in, one line out.
    fn run_demangler(&self, mangled: &[&str]) -> Result<Vec<String>, ToolError> {
        let mut input = mangled.join("\n");
        input.push('\n');
        let mut command = Command::new(&self.config.cxxfilt);
        let output = checked(&self.config.cxxfilt, run(&mut command, Some(input.as_bytes()))?)?;
        Ok(decode(&output.stdout)
            .lines()
            .map(|line| line.trim().to_owned())
            .collect())
    }
}

impl Default for CommandToolchain {
    fn default() -> Self {
        Self::new(ToolchainConfig::default())
    }
}

impl Toolchain for CommandToolchain {
    fn build(&self, unit: &TranslationUnit<'_>, options: &[String]) -> Result<BuildArtifacts, BuildFailure> {
        self.compile(unit, options)
    }

    fn demangle(&self, mangled: &str) -> Option<String> {
        self.demangle_all(&[mangled.to_owned()])?.pop()
    }

    fn demangle_all(&self, mangled: &[String]) -> Option<Vec<String>> {
        let mut missing: Vec<&str> = {
            let cache = self.demangled.lock();
            mangled
                .iter()
                .map(String::as_str)
                .filter(|m| !cache.contains_key(*m))
                .collect()
        };
        missing.sort_unstable();
        missing.dedup();

        if !missing.is_empty() {
            let demangled = match self.run_demangler(&missing) {
                Ok(demangled) => demangled,
                Err(e) => {
                    tracing::warn!("{} failed on {} symbols: {}", self.config.cxxfilt, missing.len(), e);
                    return None;
                }
            };
            if demangled.len() != missing.len() || demangled.iter().any(String::is_empty) {
                tracing::warn!(
                    sent = missing.len(),
                    received = demangled.len(),
                    "{} returned unusable output",
                    self.config.cxxfilt
                );
                return None;
            }
            let mut cache = self.demangled.lock();
            for (m, d) in missing.iter().zip(demangled) {
                cache.insert((*m).to_owned(), d);
            }
        }

        let cache = self.demangled.lock();
        mangled.iter().map(|m| cache.get(m).cloned()).collect()
    }
}

impl std::fmt::Debug for CommandToolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandToolchain")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Write the program and its headers; returns the source file name.
fn write_inputs(dir: &TempDir, unit: &TranslationUnit<'_>) -> Result<String, ToolError> {
    for header in unit.headers {
        let relative = header_path(&header.name)?;
        let path = dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &header.source)?;
    }
    let source = format!("{}.cpp", sanitize(unit.name));
    std::fs::write(dir.path().join(&source), unit.source)?;
    Ok(source)
}

/// Header names may contain directories but must stay below the build root.
fn header_path(name: &str) -> Result<&Path, ToolError> {
    let path = Path::new(name);
    let escapes = name.is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ToolError::HeaderPath(name.to_owned()));
    }
    Ok(path)
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "program".into()
    } else {
        cleaned
    }
}

fn run(command: &mut Command, stdin: Option<&[u8]>) -> Result<Output, ToolError> {
    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn()?;
    // Feed stdin from its own thread so a large batch cannot fill the
    // stdout pipe while we are still writing.
    std::thread::scope(|scope| -> Result<Output, ToolError> {
        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => Some(scope.spawn(move || {
                use std::io::Write;
                pipe.write_all(input)
            })),
            _ => None,
        };
        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            writer
                .join()
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "stdin writer panicked"))??;
        }
        Ok(output)
    })
}

fn checked(tool: &str, output: Output) -> Result<Output, ToolError> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(ToolError::Subprocess {
            tool: tool.to_owned(),
            status: output.status,
            stderr: decode(&output.stderr),
        })
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
