//! `forge-build`: compile a directory of kernel sources into one library.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, ValueEnum};
use forge_build::{BuildConfig, Toolchain, build_library};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ToolchainArg {
    /// Host reference kernels (`.c` to `.so`).
    Clang,
    /// CUDA kernels (`.cu` to `.cubin`).
    Nvcc,
}

#[derive(Parser, Debug)]
#[command(name = "forge-build", version, about = "Compile kernel sources into a single kernel library")]
struct Cli {
    /// Directory containing the kernel sources.
    #[arg(value_name = "SOURCE_DIR")]
    source_dir: PathBuf,
    /// Directory receiving the library artifact (created if missing).
    #[arg(value_name = "OUTPUT_DIR")]
    output_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = ToolchainArg::Clang)]
    toolchain: ToolchainArg,
    /// GPU architecture for `--toolchain nvcc`.
    #[arg(long, default_value = "sm_80")]
    arch: String,
    /// File stem of the artifact.
    #[arg(long, default_value = "default")]
    name: String,
    /// Also write `<name>_library.rs` embedding the artifact bytes.
    #[arg(long)]
    emit_rust: bool,
    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let toolchain = match cli.toolchain {
        ToolchainArg::Clang => Toolchain::clang(),
        ToolchainArg::Nvcc => Toolchain::nvcc(cli.arch),
    };
    let config = BuildConfig::new(cli.source_dir, cli.output_dir)
        .with_toolchain(toolchain)
        .with_library_name(cli.name)
        .with_emit_rust(cli.emit_rust);

    match build_library(&config) {
        Ok(output) => {
            println!("{}", output.library.display());
            if let Some(embedded) = output.embedded {
                println!("{}", embedded.display());
            }
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("forge-build: {error}");
            let mut source = std::error::Error::source(&error);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}
