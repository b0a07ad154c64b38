//! One compilation session.
//!
//! ```text
//! Created ──add_name_expression──▶ Created
//!    │
//!    └─compile──▶ Compiling ──ok──▶ Compiled ──lowered_name / code──▶ Compiled
//!                     │
//!                     └──failed──▶ Created (log kept)
//! ```

use std::collections::BTreeMap;

use gpucompat_core::{BuildArtifacts, BuildFailure, DeviceId, Header, Toolchain};

use crate::error::RtcError;
use crate::name_expr::{strip_name_expression, without_whitespace, SignaturePrefix};
use crate::options::AssembledOptions;

/// Opaque identifier of a program in a [`crate::ProgramStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub(crate) u64);

impl ProgramHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    /// A build is running with the session unlocked.
    Compiling,
    Compiled,
}

/// A registered name expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameExpression {
    pub raw: String,
    pub stripped: String,
    /// Suffix of the marker variable emitted for this expression.
    pub id: u32,
    /// Mangled symbol, filled in by the first successful lookup.
    pub lowered: Option<String>,
}

/// Snapshot of what a build needs, taken while the session is locked.
#[derive(Debug, Clone)]
pub(crate) struct BuildInput {
    pub name: String,
    pub source: String,
    pub headers: Vec<Header>,
    pub device: DeviceId,
}

/// Outcome of the locked half of a lowered-name query.
#[derive(Debug)]
pub(crate) enum Lookup {
    Resolved(String),
    /// The build's symbols must be demangled before the query can finish.
    Pending(PendingLookup),
}

#[derive(Debug)]
pub(crate) struct PendingLookup {
    expr: String,
    key: String,
    stripped: String,
    pub symbols: Vec<String>,
    generation: u64,
}

#[derive(Debug)]
pub struct ProgramSession {
    handle: ProgramHandle,
    name: String,
    device: DeviceId,
    source: String,
    headers: Vec<Header>,
    expressions: BTreeMap<String, NameExpression>,
    state: SessionState,
    program_log: String,
    build_log: String,
    artifacts: Option<BuildArtifacts>,
    /// Bumped by every successful build.
    generation: u64,
}

impl ProgramSession {
    pub(crate) fn new(
        handle: ProgramHandle,
        name: String,
        device: DeviceId,
        source: String,
        headers: Vec<Header>,
    ) -> Self {
        Self {
            handle,
            name,
            device,
            source,
            headers,
            expressions: BTreeMap::new(),
            state: SessionState::Created,
            program_log: String::new(),
            build_log: String::new(),
            artifacts: None,
            generation: 0,
        }
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Source including the appended name-expression markers.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn name_expression(&self, raw: &str) -> Option<&NameExpression> {
        self.expressions.get(raw)
    }

    /// Register `expr` and return its marker id.
    ///
    /// The marker forces the compiler to emit a symbol for the expression.
    /// Registering the same string again returns the first id.
    pub fn add_name_expression(&mut self, expr: &str) -> Result<u32, RtcError> {
        if expr.trim().is_empty() {
            return Err(RtcError::InvalidInput("empty name expression".into()));
        }
        if self.state != SessionState::Created {
            return Err(RtcError::NoNameExpressionsAfterCompilation);
        }
        if let Some(existing) = self.expressions.get(expr) {
            return Ok(existing.id);
        }

        let id = self.expressions.len() as u32 + 1;
        self.expressions.insert(
            expr.to_owned(),
            NameExpression {
                raw: expr.to_owned(),
                stripped: strip_name_expression(expr),
                id,
                lowered: None,
            },
        );
        self.source.push_str(&format!(
            "\nextern \"C\" constexpr auto __gpucompat_rtc_{id} = {expr};"
        ));
        Ok(id)
    }

    pub(crate) fn begin_compile(&mut self) -> Result<BuildInput, RtcError> {
        if self.state == SessionState::Compiling {
            return Err(RtcError::InvalidProgram);
        }
        self.state = SessionState::Compiling;
        Ok(BuildInput {
            name: self.name.clone(),
            source: self.source.clone(),
            headers: self.headers.clone(),
            device: self.device,
        })
    }

    pub(crate) fn finish_compile(
        &mut self,
        options: &AssembledOptions,
        result: Result<BuildArtifacts, BuildFailure>,
    ) -> Result<(), RtcError> {
        self.program_log = options.notes.iter().map(|n| format!("{n}\n")).collect();
        match result {
            Ok(artifacts) => {
                self.build_log = artifacts.log.clone();
                self.artifacts = Some(artifacts);
                self.generation += 1;
                for entry in self.expressions.values_mut() {
                    entry.lowered = None;
                }
                self.state = SessionState::Compiled;
                Ok(())
            }
            Err(failure) => {
                self.build_log = failure.log;
                // A previous successful build stays usable.
                self.state = if self.artifacts.is_some() {
                    SessionState::Compiled
                } else {
                    SessionState::Created
                };
                Err(RtcError::Compilation)
            }
        }
    }

    /// Resolve a registered name expression to its mangled symbol.
    pub fn lowered_name(&mut self, expr: &str, toolchain: &dyn Toolchain) -> Result<String, RtcError> {
        match self.begin_lookup(expr)? {
            Lookup::Resolved(lowered) => Ok(lowered),
            Lookup::Pending(pending) => {
                let demangled = toolchain.demangle_all(&pending.symbols);
                self.finish_lookup(pending, demangled)
            }
        }
    }

    /// Find the entry for `expr` and return its cached symbol, or the
    /// symbols that still need demangling.
    pub(crate) fn begin_lookup(&self, expr: &str) -> Result<Lookup, RtcError> {
        let not_valid = || RtcError::NameExpressionNotValid(expr.to_owned());

        let Some(artifacts) = self.artifacts.as_ref().filter(|_| self.state == SessionState::Compiled)
        else {
            return Err(not_valid());
        };

        let entry = match self.expressions.get(expr) {
            Some(entry) => entry,
            None => {
                let wanted = without_whitespace(&strip_name_expression(expr));
                self.expressions
                    .values()
                    .find(|e| without_whitespace(&e.stripped) == wanted)
                    .ok_or_else(not_valid)?
            }
        };
        if let Some(lowered) = &entry.lowered {
            return Ok(Lookup::Resolved(lowered.clone()));
        }

        Ok(Lookup::Pending(PendingLookup {
            expr: expr.to_owned(),
            key: entry.raw.clone(),
            stripped: entry.stripped.clone(),
            symbols: artifacts.lowered_names.clone(),
            generation: self.generation,
        }))
    }

    /// Match the demangled symbols against the expression.
    ///
    /// The result is cached only if no build finished in between.
    pub(crate) fn finish_lookup(
        &mut self,
        pending: PendingLookup,
        demangled: Option<Vec<String>>,
    ) -> Result<String, RtcError> {
        let Some(demangled) = demangled.filter(|d| d.len() == pending.symbols.len()) else {
            tracing::warn!(
                program = %self.name,
                symbols = pending.symbols.len(),
                "unable to demangle lowered names"
            );
            return Err(RtcError::Compilation);
        };

        let lowered = pending
            .symbols
            .iter()
            .zip(&demangled)
            .find(|(_, demangled)| {
                SignaturePrefix::parse(demangled).is_ok_and(|prefix| prefix.matches(&pending.stripped))
            })
            .map(|(mangled, _)| mangled.clone())
            .ok_or_else(|| RtcError::NameExpressionNotValid(pending.expr.clone()))?;

        if self.generation == pending.generation {
            if let Some(entry) = self.expressions.get_mut(&pending.key) {
                entry.lowered = Some(lowered.clone());
            }
        }
        Ok(lowered)
    }

    pub fn code(&self) -> Result<&[u8], RtcError> {
        match (&self.artifacts, self.state) {
            (Some(artifacts), SessionState::Compiled) => Ok(&artifacts.binary),
            _ => Err(RtcError::InvalidProgram),
        }
    }

    /// Program notes followed by compiler diagnostics of the last build.
    pub fn log(&self) -> String {
        format!("{}{}", self.program_log, self.build_log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucompat_testkit::FakeToolchain;

    fn session(source: &str) -> ProgramSession {
        ProgramSession::new(
            ProgramHandle(1),
            "test.cu".into(),
            DeviceId(0),
            source.into(),
            Vec::new(),
        )
    }

    fn compile(session: &mut ProgramSession, toolchain: &dyn Toolchain) -> Result<(), RtcError> {
        let input = session.begin_compile()?;
        let unit = gpucompat_core::TranslationUnit {
            name: &input.name,
            source: &input.source,
            headers: &input.headers,
            device: input.device,
        };
        let result = toolchain.build(&unit, &[]);
        session.finish_compile(&AssembledOptions::default(), result)
    }

    #[test]
    fn test_markers_are_appended_once() {
        let mut session = session("__global__ void k(){}");
        assert_eq!(session.add_name_expression("k").unwrap(), 1);
        assert_eq!(session.add_name_expression("&other").unwrap(), 2);
        assert_eq!(session.add_name_expression("k").unwrap(), 1);

        assert_eq!(
            session.source(),
            "__global__ void k(){}\n\
             extern \"C\" constexpr auto __gpucompat_rtc_1 = k;\n\
             extern \"C\" constexpr auto __gpucompat_rtc_2 = &other;"
        );
        assert_eq!(session.name_expression("&other").unwrap().stripped, "other");
    }

    #[test]
    fn test_lowered_name_requires_compile() {
        let mut session = session("__global__ void k(){}");
        session.add_name_expression("k").unwrap();
        let toolchain = FakeToolchain::new();
        assert!(matches!(
            session.lowered_name("k", &toolchain),
            Err(RtcError::NameExpressionNotValid(_))
        ));
        assert!(matches!(
            session.lowered_name("never", &toolchain),
            Err(RtcError::NameExpressionNotValid(_))
        ));
    }

    #[test]
    fn test_lowered_name_skips_descriptors() {
        let toolchain = FakeToolchain::new();
        let mut session = session("__global__ void k(){}");
        session.add_name_expression("k").unwrap();
        compile(&mut session, &toolchain).unwrap();

        // The descriptor `_Z1kv.kd` is emitted first and must not match.
        assert_eq!(session.lowered_name("k", &toolchain).unwrap(), "_Z1kv");
        assert_eq!(session.name_expression("k").unwrap().lowered.as_deref(), Some("_Z1kv"));
    }

    #[test]
    fn test_failed_compile_keeps_state() {
        let toolchain = FakeToolchain::new().failing("error: expected ';'");
        let mut session = session("__global__ void k(){}");
        session.add_name_expression("k").unwrap();
        let source = session.source().to_owned();

        assert_eq!(compile(&mut session, &toolchain), Err(RtcError::Compilation));
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(session.source(), source);
        assert_eq!(session.log(), "error: expected ';'");
        assert_eq!(session.code(), Err(RtcError::InvalidProgram));

        // Still accepts name expressions, as nothing was compiled.
        session.add_name_expression("k2").unwrap();
    }

    #[test]
    fn test_no_expressions_after_compile() {
        let toolchain = FakeToolchain::new();
        let mut session = session("__global__ void k(){}");
        compile(&mut session, &toolchain).unwrap();
        assert_eq!(
            session.add_name_expression("k"),
            Err(RtcError::NoNameExpressionsAfterCompilation)
        );
    }

    #[test]
    fn test_demangle_failure_is_compilation_error() {
        let toolchain = FakeToolchain::new().with_broken_demangler();
        let mut session = session("__global__ void k(){}");
        session.add_name_expression("k").unwrap();
        compile(&mut session, &toolchain).unwrap();
        assert_eq!(session.lowered_name("k", &toolchain), Err(RtcError::Compilation));
    }

    #[test]
    fn test_short_demangler_output_is_compilation_error() {
        let toolchain = FakeToolchain::new();
        let mut session = session("__global__ void k(){}");
        session.add_name_expression("k").unwrap();
        compile(&mut session, &toolchain).unwrap();

        let Lookup::Pending(pending) = session.begin_lookup("k").unwrap() else {
            panic!("nothing cached yet");
        };
        assert_eq!(pending.symbols, ["_Z1kv.kd", "_Z1kv"]);
        let short = vec!["k() (.kd)".to_owned()];
        assert_eq!(session.finish_lookup(pending, Some(short)), Err(RtcError::Compilation));
        assert_eq!(session.name_expression("k").unwrap().lowered, None);
    }

    #[test]
    fn test_lookup_across_rebuild_is_not_cached() {
        let toolchain = FakeToolchain::new();
        let mut session = session("__global__ void k(){}");
        session.add_name_expression("k").unwrap();
        compile(&mut session, &toolchain).unwrap();

        let Lookup::Pending(pending) = session.begin_lookup("k").unwrap() else {
            panic!("nothing cached yet");
        };
        let demangled = toolchain.demangle_all(&pending.symbols);
        compile(&mut session, &toolchain).unwrap();

        assert_eq!(session.finish_lookup(pending, demangled).unwrap(), "_Z1kv");
        assert_eq!(session.name_expression("k").unwrap().lowered, None);

        assert_eq!(session.lowered_name("k", &toolchain).unwrap(), "_Z1kv");
        assert!(matches!(session.begin_lookup("k"), Ok(Lookup::Resolved(_))));
    }

    #[test]
    fn test_empty_expression_rejected() {
        let mut session = session("");
        assert!(matches!(
            session.add_name_expression("  "),
            Err(RtcError::InvalidInput(_))
        ));
    }
}
