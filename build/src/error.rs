use std::path::PathBuf;

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad classes of build failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Toolchain or directories are not usable; nothing was built.
    Configuration,
    Compile,
    Link,
    Io,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("toolchain program '{program}' is not available: {reason}"))]
    MissingToolchain { program: String, reason: String },

    #[snafu(display("kernel source directory {} does not exist", path.display()))]
    SourceDirMissing { path: PathBuf },

    #[snafu(display("no .{extension} kernel sources in {}", path.display()))]
    NoSources { path: PathBuf, extension: String },

    #[snafu(display("cannot use output directory {}: {source}", path.display()))]
    OutputDir { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to compile {}:\n{diagnostic}", file.display()))]
    Compile { file: PathBuf, diagnostic: String },

    #[snafu(display("failed to link {} into {}:\n{diagnostic}", display_inputs(inputs), output.display()))]
    Link { inputs: Vec<PathBuf>, output: PathBuf, diagnostic: String },

    #[snafu(display("failed to spawn {program}: {source}"))]
    Spawn { program: String, source: std::io::Error },

    #[snafu(display("I/O error on {}: {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingToolchain { .. }
            | Error::SourceDirMissing { .. }
            | Error::NoSources { .. }
            | Error::OutputDir { .. } => ErrorKind::Configuration,
            Error::Compile { .. } => ErrorKind::Compile,
            Error::Link { .. } => ErrorKind::Link,
            Error::Spawn { .. } | Error::Io { .. } => ErrorKind::Io,
        }
    }
}

fn display_inputs(inputs: &[PathBuf]) -> String {
    inputs.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
}
