//! Output and source-loading abstractions.
//!
//! `print` output from the VM goes through a [`PrintWriter`] so hosts and
//! tests can capture it. Imports resolve source text through a
//! [`SourceLoader`], letting tests compile multi-file programs without
//! touching the filesystem.

use std::{
    cell::RefCell,
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use ahash::AHashMap;

/// Trait for handling output from the `print` statement.
///
/// The VM calls [`PrintWriter::write`] once per `ECHO`d argument and
/// [`PrintWriter::newline`] for each `ECHO_NEWLINE`.
pub trait PrintWriter {
    /// Writes one formatted argument, with no separator or terminator.
    fn write(&mut self, output: &str);

    /// Terminates the current print statement's output line.
    fn newline(&mut self);
}

/// Default `PrintWriter` that writes to stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

thread_local! {
    /// Thread-local stdout buffer so interleaved diagnostics on stderr appear
    /// before buffered program output.
    static STDOUT_BUFFER: RefCell<String> = const { RefCell::new(String::new()) };
}

impl PrintWriter for StdPrint {
    fn write(&mut self, output: &str) {
        STDOUT_BUFFER.with(|buf| buf.borrow_mut().push_str(output));
    }

    fn newline(&mut self) {
        STDOUT_BUFFER.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.push('\n');
            let mut stdout = io::stdout().lock();
            let _ = stdout.write_all(buf.as_bytes());
            let _ = stdout.flush();
            buf.clear();
        });
    }
}

/// `PrintWriter` that collects output into a string, for tests and embedders.
#[derive(Debug, Default)]
pub struct CollectPrint {
    output: String,
}

impl CollectPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything written so far.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Consumes the writer and returns the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.output
    }
}

impl PrintWriter for CollectPrint {
    fn write(&mut self, output: &str) {
        self.output.push_str(output);
    }

    fn newline(&mut self) {
        self.output.push('\n');
    }
}

/// `PrintWriter` that discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write(&mut self, _output: &str) {}

    fn newline(&mut self) {}
}

/// Resolves and reads imported source files.
pub trait SourceLoader {
    /// Resolves `path` relative to the directory of `importer` and returns
    /// the canonical path used for import deduplication together with the
    /// file's contents. `importer` is `None` for the entry file.
    fn load(&self, path: &str, importer: Option<&Path>) -> io::Result<(PathBuf, String)>;
}

/// Loader backed by the real filesystem.
#[derive(Debug, Default)]
pub struct OsLoader;

impl SourceLoader for OsLoader {
    fn load(&self, path: &str, importer: Option<&Path>) -> io::Result<(PathBuf, String)> {
        let mut resolved = match importer.and_then(Path::parent) {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        };
        if resolved.extension().is_none() {
            resolved.set_extension("ace");
        }
        let canonical = resolved.canonicalize()?;
        let text = std::fs::read_to_string(&canonical)?;
        Ok((canonical, text))
    }
}

/// In-memory loader for tests and embedders.
#[derive(Debug, Default)]
pub struct MemLoader {
    files: AHashMap<PathBuf, String>,
}

impl MemLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a virtual file.
    pub fn insert(&mut self, path: impl Into<PathBuf>, text: impl Into<String>) {
        self.files.insert(path.into(), text.into());
    }
}

impl SourceLoader for MemLoader {
    fn load(&self, path: &str, importer: Option<&Path>) -> io::Result<(PathBuf, String)> {
        let resolved = match importer.and_then(Path::parent) {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(path),
            _ => PathBuf::from(path),
        };
        match self.files.get(&resolved) {
            Some(text) => Ok((resolved, text.clone())),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such virtual file: {}", resolved.display()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_print_gathers_lines() {
        let mut writer = CollectPrint::new();
        writer.write("1");
        writer.write(" 2");
        writer.newline();
        writer.write("3");
        writer.newline();
        assert_eq!(writer.output(), "1 2\n3\n");
    }

    #[test]
    fn mem_loader_resolves_relative_to_importer() {
        let mut loader = MemLoader::new();
        loader.insert("lib/util.ace", "let x = 1");
        let (path, text) = loader.load("util.ace", Some(Path::new("lib/main.ace"))).unwrap();
        assert_eq!(path, PathBuf::from("lib/util.ace"));
        assert_eq!(text, "let x = 1");
    }
}
