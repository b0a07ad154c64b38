//! Registry of compilation sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gpucompat_core::{DeviceId, Header, Toolchain, TranslationUnit};
use parking_lot::Mutex;

use crate::config::RtcConfig;
use crate::error::RtcError;
use crate::options::assemble_options;
use crate::session::{Lookup, ProgramHandle, ProgramSession};

/// Name given to programs created without one.
pub const DEFAULT_PROGRAM_NAME: &str = "default_program";

/// Maps program handles to sessions.
///
/// The map lock only covers insert, lookup and removal. Each session has its
/// own lock, and neither is held while the toolchain runs.
pub struct ProgramStore {
    config: RtcConfig,
    toolchain: Arc<dyn Toolchain>,
    sessions: Mutex<HashMap<ProgramHandle, Arc<Mutex<ProgramSession>>>>,
    next_id: AtomicU64,
}

impl ProgramStore {
    pub fn new(config: RtcConfig, toolchain: Arc<dyn Toolchain>) -> Self {
        Self {
            config,
            toolchain,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RtcConfig {
        &self.config
    }

    pub fn toolchain(&self) -> &Arc<dyn Toolchain> {
        &self.toolchain
    }

    /// `(major, minor)` of the runtime compiled programs are built against.
    pub fn version(&self) -> (u32, u32) {
        (self.config.version.major, self.config.version.minor)
    }

    /// Create a program for `device`.
    ///
    /// `num_headers` entries are taken from `header_sources` and
    /// `header_names`, which must both be present when it is nonzero.
    pub fn create_program(
        &self,
        source: &str,
        name: Option<&str>,
        num_headers: i32,
        header_sources: Option<&[&str]>,
        header_names: Option<&[&str]>,
        device: DeviceId,
    ) -> Result<ProgramHandle, RtcError> {
        let count = usize::try_from(num_headers)
            .map_err(|_| RtcError::InvalidInput(format!("negative header count {num_headers}")))?;

        let mut headers = Vec::with_capacity(count + 1);
        let mut user_headers = Vec::with_capacity(count);
        if count > 0 {
            let (Some(sources), Some(names)) = (header_sources, header_names) else {
                return Err(RtcError::InvalidInput(format!(
                    "{count} headers declared but header arrays missing"
                )));
            };
            if sources.len() < count || names.len() < count {
                return Err(RtcError::InvalidInput(format!(
                    "{count} headers declared, got {} sources and {} names",
                    sources.len(),
                    names.len()
                )));
            }
            user_headers.extend(
                sources
                    .iter()
                    .zip(names)
                    .take(count)
                    .map(|(source, name)| Header::new(*name, *source)),
            );
        }

        if self.config.rtc_mode {
            let builtin = self.config.builtin_header.clone().ok_or_else(|| {
                RtcError::BuiltinOperationFailure("builtin runtime header unavailable".into())
            })?;
            headers.push(builtin);
        }
        headers.append(&mut user_headers);

        if !self.toolchain.supports_device(device) {
            return Err(RtcError::ProgramCreationFailure(format!(
                "no device program for device {device}"
            )));
        }

        let handle = ProgramHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.filter(|n| !n.is_empty()).unwrap_or(DEFAULT_PROGRAM_NAME);
        let session = ProgramSession::new(handle, name.to_owned(), device, source.to_owned(), headers);
        self.sessions.lock().insert(handle, Arc::new(Mutex::new(session)));

        tracing::debug!(program = handle.id(), name, %device, "created program");
        Ok(handle)
    }

    fn session(&self, program: ProgramHandle) -> Result<Arc<Mutex<ProgramSession>>, RtcError> {
        self.sessions
            .lock()
            .get(&program)
            .cloned()
            .ok_or(RtcError::InvalidProgram)
    }

    pub fn add_name_expression(&self, program: ProgramHandle, expr: &str) -> Result<u32, RtcError> {
        let session = self.session(program)?;
        let id = session.lock().add_name_expression(expr)?;
        tracing::trace!(program = program.id(), expr, id, "added name expression");
        Ok(id)
    }

    pub fn compile_program<S: AsRef<str>>(
        &self,
        program: ProgramHandle,
        options: &[S],
    ) -> Result<(), RtcError> {
        let session = self.session(program)?;
        if let Some(bad) = options.iter().map(AsRef::as_ref).find(|o| o.contains('\0')) {
            return Err(RtcError::InvalidOption(bad.replace('\0', "\\0")));
        }
        let input = session.lock().begin_compile()?;
        let assembled = assemble_options(&self.config, options);

        tracing::debug!(
            program = program.id(),
            options = ?assembled.options,
            "compiling program"
        );
        let unit = TranslationUnit {
            name: &input.name,
            source: &input.source,
            headers: &input.headers,
            device: input.device,
        };
        let result = self.toolchain.build(&unit, &assembled.options);

        let outcome = session.lock().finish_compile(&assembled, result);
        if outcome.is_err() {
            tracing::debug!(program = program.id(), "compilation failed");
        }
        outcome
    }

    /// Mangled symbol for a registered name expression.
    ///
    /// Demangling runs with the session unlocked, so other queries on the
    /// program are not held up by the demangler.
    pub fn lowered_name(&self, program: ProgramHandle, expr: &str) -> Result<String, RtcError> {
        let session = self.session(program)?;
        let pending = match session.lock().begin_lookup(expr)? {
            Lookup::Resolved(lowered) => return Ok(lowered),
            Lookup::Pending(pending) => pending,
        };
        let demangled = self.toolchain.demangle_all(&pending.symbols);
        let lowered = session.lock().finish_lookup(pending, demangled);
        lowered
    }

    pub fn code(&self, program: ProgramHandle) -> Result<Vec<u8>, RtcError> {
        let session = self.session(program)?;
        let session = session.lock();
        session.code().map(<[u8]>::to_vec)
    }

    pub fn code_size(&self, program: ProgramHandle) -> Result<usize, RtcError> {
        let session = self.session(program)?;
        let session = session.lock();
        session.code().map(<[u8]>::len)
    }

    pub fn program_log(&self, program: ProgramHandle) -> Result<String, RtcError> {
        Ok(self.session(program)?.lock().log())
    }

    /// Log size including the terminating NUL a C caller would copy.
    pub fn program_log_size(&self, program: ProgramHandle) -> Result<usize, RtcError> {
        Ok(self.program_log(program)?.len() + 1)
    }

    pub fn destroy_program(&self, program: ProgramHandle) -> Result<(), RtcError> {
        match self.sessions.lock().remove(&program) {
            Some(_) => {
                tracing::debug!(program = program.id(), "destroyed program");
                Ok(())
            }
            None => Err(RtcError::InvalidProgram),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Destroy every program.
    pub fn clear(&self) {
        let drained: Vec<_> = self.sessions.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "destroyed remaining programs");
        }
    }
}

impl std::fmt::Debug for ProgramStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramStore")
            .field("config", &self.config)
            .field("programs", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BUILTIN_HEADER_NAME;
    use gpucompat_core::{BuildArtifacts, BuildFailure, TranslationUnit};
    use gpucompat_testkit::FakeToolchain;
    use std::sync::mpsc;

    const KERNEL: &str = "__global__ void k(){}";

    fn store_with(toolchain: FakeToolchain) -> (ProgramStore, Arc<FakeToolchain>) {
        let toolchain = Arc::new(toolchain);
        (ProgramStore::new(RtcConfig::default(), toolchain.clone()), toolchain)
    }

    fn create(store: &ProgramStore, source: &str) -> ProgramHandle {
        store
            .create_program(source, Some("k.cu"), 0, None, None, DeviceId(0))
            .unwrap()
    }

    /// Holds every `demangle_all` call until the test releases it.
    struct GatedDemangler {
        inner: FakeToolchain,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Toolchain for GatedDemangler {
        fn build(&self, unit: &TranslationUnit<'_>, options: &[String]) -> Result<BuildArtifacts, BuildFailure> {
            self.inner.build(unit, options)
        }

        fn demangle(&self, mangled: &str) -> Option<String> {
            self.inner.demangle(mangled)
        }

        fn demangle_all(&self, mangled: &[String]) -> Option<Vec<String>> {
            self.entered.lock().send(()).unwrap();
            self.release.lock().recv().unwrap();
            self.inner.demangle_all(mangled)
        }
    }

    #[test]
    fn test_kernel_scenario() {
        let (store, _) = store_with(FakeToolchain::new());
        let program = create(&store, KERNEL);
        store.add_name_expression(program, "k").unwrap();
        store.compile_program::<&str>(program, &[]).unwrap();
        assert_eq!(store.lowered_name(program, "k").unwrap(), "_Z1kv");
        assert_eq!(store.code(program).unwrap(), b"\x7fFAKEk.cu");
        assert_eq!(store.code_size(program).unwrap(), 9);
    }

    #[test]
    fn test_template_round_trip() {
        let (store, _) = store_with(
            FakeToolchain::new().with_symbol("_Z3fooIiEvv", "void foo<int>()"),
        );
        let program = create(&store, "template <typename T> __global__ void foo() {}");
        store.add_name_expression(program, "&foo<int>").unwrap();
        store.compile_program::<&str>(program, &[]).unwrap();

        let lowered = store.lowered_name(program, "foo<int>").unwrap();
        assert_eq!(lowered, "_Z3fooIiEvv");
        assert!(!lowered.chars().any(char::is_whitespace));
        assert!(!lowered.contains(".kd"));
        assert_eq!(store.lowered_name(program, "&foo<int>").unwrap(), lowered);
    }

    #[test]
    fn test_missing_header_names() {
        let (store, _) = store_with(FakeToolchain::new());
        let result = store.create_program(
            KERNEL,
            None,
            2,
            Some(&["#define A 1", "#define B 2"][..]),
            None,
            DeviceId(0),
        );
        assert!(matches!(result, Err(RtcError::InvalidInput(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_header_validation() {
        let (store, _) = store_with(FakeToolchain::new());
        let negative = store.create_program(KERNEL, None, -1, None, None, DeviceId(0));
        assert!(matches!(negative, Err(RtcError::InvalidInput(_))));

        let short = store.create_program(KERNEL, None, 2, Some(&["a"][..]), Some(&["a.h"][..]), DeviceId(0));
        assert!(matches!(short, Err(RtcError::InvalidInput(_))));

        // Arrays are ignored when no headers are declared.
        store
            .create_program(KERNEL, None, 0, Some(&["a"][..]), None, DeviceId(0))
            .unwrap();
    }

    #[test]
    fn test_builtin_header_prepended() {
        let (store, toolchain) = store_with(FakeToolchain::new());
        let program = store
            .create_program(KERNEL, None, 1, Some(&["#define N 4"][..]), Some(&["n.h"][..]), DeviceId(0))
            .unwrap();
        store.compile_program(program, &["-O3"]).unwrap();

        let build = toolchain.last_build().unwrap();
        let names: Vec<_> = build.headers.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, [BUILTIN_HEADER_NAME, "n.h"]);
        assert_eq!(build.name, DEFAULT_PROGRAM_NAME);
        assert_eq!(build.options.last().map(String::as_str), Some("-O3"));
    }

    #[test]
    fn test_missing_builtin_header() {
        let toolchain = Arc::new(FakeToolchain::new());
        let config = RtcConfig {
            builtin_header: None,
            ..RtcConfig::default()
        };
        let store = ProgramStore::new(config, toolchain);
        assert!(matches!(
            store.create_program(KERNEL, None, 0, None, None, DeviceId(0)),
            Err(RtcError::BuiltinOperationFailure(_))
        ));
    }

    #[test]
    fn test_unsupported_device() {
        let (store, _) = store_with(FakeToolchain::new().without_device(DeviceId(3)));
        assert!(matches!(
            store.create_program(KERNEL, None, 0, None, None, DeviceId(3)),
            Err(RtcError::ProgramCreationFailure(_))
        ));
    }

    #[test]
    fn test_failed_compile_then_recompile() {
        let (store, toolchain) = store_with(FakeToolchain::new().failing("k.cu:1: error"));
        let program = create(&store, KERNEL);
        store.add_name_expression(program, "k").unwrap();

        assert_eq!(
            store.compile_program(program, &["-rtc-pch"]),
            Err(RtcError::Compilation)
        );
        let log = store.program_log(program).unwrap();
        assert!(log.contains("-rtc-pch"));
        assert!(log.ends_with("k.cu:1: error"));
        assert_eq!(store.program_log_size(program).unwrap(), log.len() + 1);
        assert!(matches!(
            store.lowered_name(program, "k"),
            Err(RtcError::NameExpressionNotValid(_))
        ));

        toolchain.heal();
        store.compile_program::<&str>(program, &[]).unwrap();
        assert_eq!(store.lowered_name(program, "k").unwrap(), "_Z1kv");
        assert_eq!(toolchain.builds().len(), 2);
    }

    #[test]
    fn test_option_with_nul_is_rejected() {
        let (store, toolchain) = store_with(FakeToolchain::new());
        let program = create(&store, KERNEL);
        assert!(matches!(
            store.compile_program(program, &["-DX=1", "-O\03"]),
            Err(RtcError::InvalidOption(_))
        ));
        assert!(toolchain.builds().is_empty());

        // Nothing was compiled, so the session still takes expressions.
        store.add_name_expression(program, "k").unwrap();
        store.compile_program(program, &["-O3"]).unwrap();
    }

    #[test]
    fn test_unresolvable_expression() {
        let (store, _) = store_with(FakeToolchain::new());
        let program = create(&store, KERNEL);
        store.add_name_expression(program, "missing").unwrap();
        store.compile_program::<&str>(program, &[]).unwrap();
        assert!(matches!(
            store.lowered_name(program, "missing"),
            Err(RtcError::NameExpressionNotValid(_))
        ));
    }

    #[test]
    fn test_warning_log_after_success() {
        let (store, _) = store_with(FakeToolchain::new().with_warning("warning: unused"));
        let program = create(&store, KERNEL);
        store
            .compile_program(program, &["--gpu-architecture=gfx90a"])
            .unwrap();
        let log = store.program_log(program).unwrap();
        assert!(log.contains("--offload-arch=gfx90a"));
        assert!(log.ends_with("warning: unused"));
    }

    #[test]
    fn test_destroy_program() {
        let (store, _) = store_with(FakeToolchain::new());
        let program = create(&store, KERNEL);
        assert_eq!(store.len(), 1);
        store.destroy_program(program).unwrap();
        assert_eq!(store.destroy_program(program), Err(RtcError::InvalidProgram));
        assert_eq!(store.code(program), Err(RtcError::InvalidProgram));
        assert!(store.is_empty());
    }

    #[test]
    fn test_code_before_compile() {
        let (store, _) = store_with(FakeToolchain::new());
        let program = create(&store, KERNEL);
        assert_eq!(store.code_size(program), Err(RtcError::InvalidProgram));
        assert_eq!(store.program_log_size(program).unwrap(), 1);
    }

    #[test]
    fn test_sessions_are_independent() {
        let (store, toolchain) = store_with(FakeToolchain::new());
        let a = create(&store, KERNEL);
        let b = create(&store, "__global__ void other(){}");
        assert_eq!(store.add_name_expression(a, "k").unwrap(), 1);
        assert_eq!(store.add_name_expression(b, "other").unwrap(), 1);

        store.compile_program::<&str>(b, &[]).unwrap();
        assert!(toolchain.last_build().unwrap().source.contains("__gpucompat_rtc_1 = other;"));
        assert!(store.add_name_expression(a, "k2").is_ok());
        assert_eq!(
            store.add_name_expression(b, "other2"),
            Err(RtcError::NoNameExpressionsAfterCompilation)
        );
    }

    #[test]
    fn test_demangling_does_not_hold_session() {
        let (entered_tx, entered) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();
        let toolchain = Arc::new(GatedDemangler {
            inner: FakeToolchain::new(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let store = Arc::new(ProgramStore::new(RtcConfig::default(), toolchain));
        let program = create(&store, KERNEL);
        store.add_name_expression(program, "k").unwrap();
        store.compile_program::<&str>(program, &[]).unwrap();

        let lookup = {
            let store = store.clone();
            std::thread::spawn(move || store.lowered_name(program, "k"))
        };
        entered.recv().unwrap();

        // The demangler is parked; the program must still answer.
        assert_eq!(store.code_size(program).unwrap(), 9);
        assert!(store.program_log(program).is_ok());
        assert!(matches!(
            store.lowered_name(program, "missing"),
            Err(RtcError::NameExpressionNotValid(_))
        ));

        release.send(()).unwrap();
        assert_eq!(lookup.join().unwrap().unwrap(), "_Z1kv");

        // Cached now, so the demangler is not consulted again.
        drop(release);
        assert_eq!(store.lowered_name(program, "k").unwrap(), "_Z1kv");
    }

    #[test]
    fn test_version_and_clear() {
        let (store, _) = store_with(FakeToolchain::new());
        assert_eq!(store.version(), (1, 0));
        create(&store, KERNEL);
        create(&store, KERNEL);
        store.clear();
        assert!(store.is_empty());
    }
}
