//! Kernel library builder.
//!
//! Compiles every kernel source in a directory and links the results into a
//! single library artifact (`default.so` for the host reference device,
//! `default.cubin` for CUDA). The build either produces the whole artifact or
//! nothing: a failing source aborts it, intermediates never outlive it, and
//! the artifact only appears under its final name once linking succeeded.

pub mod error;
pub mod toolchain;


use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use snafu::{ResultExt, ensure};

pub use crate::error::{Error, ErrorKind, Result};
use crate::error::{CompileSnafu, IoSnafu, LinkSnafu, NoSourcesSnafu, OutputDirSnafu, SourceDirMissingSnafu};
pub use crate::toolchain::Toolchain;

/// Inputs of one library build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub toolchain: Toolchain,
    /// File stem of the artifact.
    pub library_name: String,
    /// Also write `<library_name>_library.rs` embedding the artifact bytes.
    pub emit_rust: bool,
}

impl BuildConfig {
    pub fn new(source_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            output_dir: output_dir.into(),
            toolchain: Toolchain::default(),
            library_name: "default".to_string(),
            emit_rust: false,
        }
    }

    pub fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn with_library_name(mut self, name: impl Into<String>) -> Self {
        self.library_name = name.into();
        self
    }

    pub fn with_emit_rust(mut self, emit_rust: bool) -> Self {
        self.emit_rust = emit_rust;
        self
    }

    /// Final location of the artifact.
    pub fn library_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.{}", self.library_name, self.toolchain.library_extension()))
    }
}

/// What a successful build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    pub library: PathBuf,
    /// Rust source embedding the artifact, when requested.
    pub embedded: Option<PathBuf>,
    /// Sources compiled into the artifact, in build order.
    pub sources: Vec<PathBuf>,
}

/// Compile and link every kernel source of `config.source_dir`.
pub fn build_library(config: &BuildConfig) -> Result<BuildOutput> {
    let toolchain = &config.toolchain;
    toolchain.probe()?;

    let sources = collect_sources(&config.source_dir, toolchain.source_extension())?;
    fs::create_dir_all(&config.output_dir).context(OutputDirSnafu { path: &config.output_dir })?;

    // Dropping the staging directory removes every intermediate, on success
    // and on any early return.
    let staging = tempfile::Builder::new()
        .prefix(".forge-build-")
        .tempdir_in(&config.output_dir)
        .context(OutputDirSnafu { path: &config.output_dir })?;

    let mut objects = Vec::with_capacity(sources.len());
    for (index, source) in sources.iter().enumerate() {
        let stem = source.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let object = staging.path().join(format!("{index:03}-{stem}.{}", toolchain.object_extension()));

        let output = toolchain.compile(source, &object)?;
        ensure!(output.status.success(), CompileSnafu { file: source, diagnostic: diagnostic(&output) });
        tracing::debug!(source = %source.display(), "compiled kernel source");
        objects.push(object);
    }

    let library = config.library_path();
    let staged = staging.path().join(library.file_name().unwrap_or_default());
    let output = toolchain.link(&objects, &staged)?;
    ensure!(
        output.status.success(),
        LinkSnafu { inputs: sources.clone(), output: &library, diagnostic: diagnostic(&output) }
    );
    fs::rename(&staged, &library).context(IoSnafu { path: &library })?;
    drop(staging);

    let embedded = if config.emit_rust { Some(emit_rust_embedding(&library, &config.library_name)?) } else { None };

    tracing::info!(library = %library.display(), sources = sources.len(), "kernel library built");
    Ok(BuildOutput { library, embedded, sources })
}

/// Kernel sources of `dir` with the given extension, sorted by path.
fn collect_sources(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    ensure!(dir.is_dir(), SourceDirMissingSnafu { path: dir });

    let mut sources = Vec::new();
    for entry in fs::read_dir(dir).context(IoSnafu { path: dir })? {
        let path = entry.context(IoSnafu { path: dir })?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
            sources.push(path);
        }
    }
    ensure!(!sources.is_empty(), NoSourcesSnafu { path: dir, extension });

    sources.sort();
    Ok(sources)
}

fn diagnostic(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    match (stderr.trim(), stdout.trim()) {
        ("", "") => format!("exited with {}", output.status),
        ("", stdout) => stdout.to_string(),
        (stderr, _) => stderr.to_string(),
    }
}

/// Write `<name>_library.rs` next to the artifact.
///
/// The file defines `KERNEL_LIBRARY` with the artifact bytes, for crates that
/// `include!` the library instead of loading it from disk.
fn emit_rust_embedding(library: &Path, name: &str) -> Result<PathBuf> {
    let bytes = fs::read(library).context(IoSnafu { path: library })?;
    let file_name = library.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();

    let mut out = String::with_capacity(bytes.len() * 6 + 128);
    let _ = writeln!(out, "// Generated by forge-build from {file_name}. Do not edit.");
    let _ = writeln!(out, "pub static KERNEL_LIBRARY: &[u8] = &[");
    for chunk in bytes.chunks(12) {
        out.push_str("   ");
        for byte in chunk {
            let _ = write!(out, " {byte:#04x},");
        }
        out.push('\n');
    }
    out.push_str("];\n");

    let path = library.with_file_name(format!("{name}_library.rs"));
    fs::write(&path, out).context(IoSnafu { path: &path })?;
    Ok(path)
}
