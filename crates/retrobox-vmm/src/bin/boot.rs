//! Boot a flat binary image in the retrobox VMM.
//!
//! Usage: cargo run --bin boot -- <image-path> [memory-mib]

use retrobox_vmm::vm::{Vm, VmConfig};
use std::env;
use std::process;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <image-path> [memory-mib]", args[0]);
        process::exit(1);
    }

    let image = match std::fs::read(&args[1]) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("failed to read {}: {e}", args[1]);
            process::exit(1);
        }
    };

    let memory_mib: usize = args
        .get(2)
        .map(|s| s.parse().expect("memory-mib must be a number"))
        .unwrap_or(128);

    let config = VmConfig {
        memory_size: memory_mib * 1024 * 1024,
        ..VmConfig::default()
    };

    log::info!("creating VM with {memory_mib} MiB memory");
    let mut vm = match Vm::new(config) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("failed to create VM: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = vm.load_image(&image) {
        eprintln!("failed to load image: {e}");
        process::exit(1);
    }

    log::info!("running guest ({} byte image)", image.len());
    match vm.run() {
        Ok(()) => log::info!("guest halted"),
        Err(e) => {
            log::error!("guest failed: {e}");
            vm.close();
            process::exit(1);
        }
    }
    vm.close();
}
