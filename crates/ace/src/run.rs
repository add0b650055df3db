//! Public interface for compiling and running Ace code.
//!
//! The core exposes two operations: compile source text (with imports
//! resolved through a [`SourceLoader`]) into a self-contained bytecode
//! container, and run a container to an exit code. [`Runner`] ties the
//! configuration records, the native registry, the output writer and the
//! tracer together for embedders.

use std::{fmt, path::PathBuf};

use crate::{
    analyze::Analyzer,
    builtins::{self, NativeRegistry},
    bytecode,
    config::{CompilerConfig, VmConfig},
    emit::Emitter,
    error::{EmitError, ErrorList},
    io::{OsLoader, PrintWriter, SourceLoader, StdPrint},
    lex::Lexer,
    parse,
    scope::CompilationUnit,
    tracer::{NoopTracer, VmTracer},
    vm::{LoadError, VmState},
    ast::Stmt,
};

/// Why a compilation produced no bytecode.
#[derive(Debug)]
pub enum CompileFailure {
    /// The source had at least one error-level diagnostic. The list is
    /// sorted by location and includes any warnings.
    Diagnostics(ErrorList),
    /// The emitter hit a violated invariant; this is a toolchain bug
    /// surfaced with the offending location.
    Emitter(EmitError),
}

impl fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Diagnostics(errors) => {
                for diagnostic in errors.iter() {
                    writeln!(f, "{diagnostic}")?;
                }
                Ok(())
            }
            Self::Emitter(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CompileFailure {}

/// A successful compilation: the container bytes plus the (warning-only)
/// diagnostic list.
#[derive(Debug)]
pub struct CompileOutput {
    pub bytecode: Vec<u8>,
    pub diagnostics: ErrorList,
}

/// Why a run could not start or finish cleanly.
#[derive(Debug)]
pub enum RunFailure {
    /// The container did not decode.
    Container(bytecode::ContainerError),
    /// The program could not be loaded into a VM.
    Load(LoadError),
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container(err) => write!(f, "{err}"),
            Self::Load(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RunFailure {}

/// Primary interface for compiling and running Ace programs.
pub struct Runner {
    config: CompilerConfig,
    vm_config: VmConfig,
    natives: NativeRegistry,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// A runner with default configuration and the standard natives.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: CompilerConfig::default(),
            vm_config: VmConfig::default(),
            natives: NativeRegistry::standard(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: CompilerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_vm_config(mut self, vm_config: VmConfig) -> Self {
        self.vm_config = vm_config;
        self
    }

    /// Registers an additional native; call before compiling so the name is
    /// visible to the analyzer.
    pub fn register_native(&mut self, entry: crate::builtins::NativeEntry) -> u32 {
        self.natives.register(entry)
    }

    /// Compiles source text to a bytecode container, resolving imports
    /// through the given loader.
    pub fn compile_source(
        &self,
        source: &str,
        name: &str,
        loader: &dyn SourceLoader,
    ) -> Result<CompileOutput, CompileFailure> {
        let mut unit = CompilationUnit::new(self.config.clone());
        builtins::declare_builtin_types(&mut unit);
        builtins::declare_natives(&mut unit, &self.natives);

        let file = unit.add_file(name);
        let tokens = Lexer::new(source, file, &mut unit.errors).tokenize();
        let mut stmts = parse::parse(&tokens, &mut unit.errors);

        let imports = Analyzer::new(&mut unit, &self.natives, loader)
            .analyze_program(&mut stmts, Some(PathBuf::from(name)));

        unit.errors.sort();
        if unit.errors.has_errors() {
            return Err(CompileFailure::Diagnostics(std::mem::take(&mut unit.errors)));
        }

        let mut sections: Vec<&[Stmt]> = imports.iter().map(|(_, stmts)| stmts.as_slice()).collect();
        sections.push(stmts.as_slice());
        let diagnostics = std::mem::take(&mut unit.errors);
        let (statics, code) = Emitter::new(&mut unit, &self.natives)
            .emit_program(&sections)
            .map_err(CompileFailure::Emitter)?;

        Ok(CompileOutput {
            bytecode: bytecode::encode(statics.entries(), &code),
            diagnostics,
        })
    }

    /// Compiles a file from disk.
    pub fn compile_file(&self, path: &str) -> Result<CompileOutput, CompileFailure> {
        let loader = OsLoader;
        let (canonical, source) = loader.load(path, None).map_err(|err| {
            let mut errors = ErrorList::new();
            errors.error(
                crate::error::DiagnosticCode::ImportNotFound,
                crate::error::SourceLocation::unknown(),
                format!("cannot read '{path}': {err}"),
            );
            CompileFailure::Diagnostics(errors)
        })?;
        self.compile_source(&source, &canonical.to_string_lossy(), &loader)
    }

    /// Runs a bytecode container to completion, printing through `writer`.
    /// Returns the program's exit code.
    pub fn run_bytecode(
        &self,
        bytes: &[u8],
        writer: &mut dyn PrintWriter,
        tracer: &mut dyn VmTracer,
    ) -> Result<i32, RunFailure> {
        let program = bytecode::decode(bytes).map_err(RunFailure::Container)?;
        let mut vm = VmState::new(&program, &self.natives, self.vm_config, writer, tracer)
            .map_err(RunFailure::Load)?;
        Ok(vm.execute())
    }

    /// Compiles and runs source text in one step.
    pub fn run_source(
        &self,
        source: &str,
        name: &str,
        loader: &dyn SourceLoader,
        writer: &mut dyn PrintWriter,
    ) -> Result<i32, Box<dyn std::error::Error>> {
        let output = self.compile_source(source, name, loader)?;
        let mut tracer = NoopTracer;
        Ok(self.run_bytecode(&output.bytecode, writer, &mut tracer)?)
    }
}

/// Compiles a file to container bytes with default settings.
pub fn compile(source_path: &str) -> Result<Vec<u8>, CompileFailure> {
    Runner::new().compile_file(source_path).map(|out| out.bytecode)
}

/// Runs container bytes with default settings, printing to stdout.
pub fn run(bytes: &[u8]) -> Result<i32, RunFailure> {
    let runner = Runner::new();
    let mut writer = StdPrint;
    let mut tracer = NoopTracer;
    runner.run_bytecode(bytes, &mut writer, &mut tracer)
}
