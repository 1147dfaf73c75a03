//! Platform kernel compilers and linkers.

use std::path::Path;
use std::process::{Command, Output};

use snafu::ResultExt;

use crate::error::{MissingToolchainSnafu, Result, SpawnSnafu};

/// Compiler and linker pair that turns kernel sources into one library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toolchain {
    /// Host reference kernels: `clang -c` per file, `clang -shared` to link.
    Clang { compiler: String },
    /// CUDA kernels: relocatable cubins per file, combined by `nvlink`.
    Nvcc { arch: String, compiler: String, linker: String },
}

impl Toolchain {
    pub fn clang() -> Self {
        Toolchain::Clang { compiler: "clang".to_string() }
    }

    pub fn nvcc(arch: impl Into<String>) -> Self {
        Toolchain::Nvcc { arch: arch.into(), compiler: "nvcc".to_string(), linker: "nvlink".to_string() }
    }

    pub fn source_extension(&self) -> &'static str {
        match self {
            Toolchain::Clang { .. } => "c",
            Toolchain::Nvcc { .. } => "cu",
        }
    }

    pub fn object_extension(&self) -> &'static str {
        match self {
            Toolchain::Clang { .. } => "o",
            Toolchain::Nvcc { .. } => "cubin",
        }
    }

    pub fn library_extension(&self) -> &'static str {
        match self {
            Toolchain::Clang { .. } => "so",
            Toolchain::Nvcc { .. } => "cubin",
        }
    }

    /// Programs that must be runnable for a build to start.
    pub fn programs(&self) -> Vec<&str> {
        match self {
            Toolchain::Clang { compiler } => vec![compiler.as_str()],
            Toolchain::Nvcc { compiler, linker, .. } => vec![compiler.as_str(), linker.as_str()],
        }
    }

    /// Check that every program of the toolchain runs.
    pub fn probe(&self) -> Result<()> {
        for program in self.programs() {
            match Command::new(program).arg("--version").output() {
                Ok(output) if output.status.success() => {
                    tracing::trace!(program, "toolchain program found");
                }
                Ok(output) => {
                    return MissingToolchainSnafu {
                        program,
                        reason: format!("--version exited with {}", output.status),
                    }
                    .fail();
                }
                Err(e) => return MissingToolchainSnafu { program, reason: e.to_string() }.fail(),
            }
        }
        Ok(())
    }

    pub(crate) fn compile(&self, source: &Path, object: &Path) -> Result<Output> {
        let (program, mut command) = match self {
            Toolchain::Clang { compiler } => {
                let mut command = Command::new(compiler);
                command.args(["-c", "-O2", "-fPIC", "-std=c11", "-fno-math-errno"]);
                (compiler, command)
            }
            Toolchain::Nvcc { arch, compiler, .. } => {
                let mut command = Command::new(compiler);
                command.args(["-cubin", "-rdc=true", "-O3"]).arg(format!("-arch={arch}"));
                (compiler, command)
            }
        };
        command.arg("-o").arg(object).arg(source);
        tracing::trace!(?command, "compiling kernel source");
        command.output().context(SpawnSnafu { program: program.as_str() })
    }

    pub(crate) fn link(&self, objects: &[impl AsRef<Path>], output: &Path) -> Result<Output> {
        let (program, mut command) = match self {
            Toolchain::Clang { compiler } => {
                let mut command = Command::new(compiler);
                command.arg("-shared");
                (compiler, command)
            }
            Toolchain::Nvcc { arch, linker, .. } => {
                let mut command = Command::new(linker);
                command.arg(format!("-arch={arch}"));
                (linker, command)
            }
        };
        command.arg("-o").arg(output);
        command.args(objects.iter().map(AsRef::as_ref));
        tracing::trace!(?command, "linking kernel library");
        command.output().context(SpawnSnafu { program: program.as_str() })
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::clang()
    }
}
