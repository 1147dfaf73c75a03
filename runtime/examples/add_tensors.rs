//! Adds two tensors with the packaged kernel library.
//!
//! Build the library first, then run with the environment pointing at it:
//!
//! ```text
//! cargo run -p forge-build -- kernels target/kernels
//! FORGE_KERNEL_DIR=target/kernels cargo run -p forge-runtime --example add_tensors
//! ```
//!
//! Pass `cuda` as the first argument to use CUDA device 0 (requires the
//! `cuda` feature and a cubin built with `--toolchain nvcc`).

use std::process::ExitCode;

use forge_device::get_device;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let device = std::env::args().nth(1).unwrap_or_else(|| "cpu".to_string());
    match run(&device) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("add_tensors: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(device: &str) -> Result<(), Box<dyn std::error::Error>> {
    let device = get_device(device)?;

    let a = device.upload(&[1.0f32, 2.0, 3.0], vec![3])?;
    let b = device.upload(&[4.0f32, 5.0, 6.0], vec![3])?;
    let c = forge_runtime::add_tensors(&a, &b)?;
    println!("{:?} + {:?} = {:?} on {}", a.to_vec::<f32>()?, b.to_vec::<f32>()?, c.to_vec::<f32>()?, c.device());

    let values: Vec<f32> = (0..44).map(|i| ((i * 37) % 101) as f32 / 101.0).collect();
    let a = device.upload(&values, vec![11, 4])?;
    let ones = device.upload(&[1.0f32; 44], vec![11, 4])?;
    let c = forge_runtime::OPERATORS.call("add_tensors", &[a, ones])?;

    let result = c.to_vec::<f32>()?;
    for (row, chunk) in result.chunks(4).enumerate() {
        println!("row {row:2}: {chunk:?}");
    }
    let exact = values.iter().zip(&result).all(|(v, r)| v + 1.0 == *r);
    println!("a + 1 matches: {exact}");
    Ok(())
}
