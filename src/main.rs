//! CLI entry point: run a 32-bit ELF executable under demand paging.

use std::path::PathBuf;
use std::process::ExitCode;

use faultload::{logging, run_program};

fn main() -> ExitCode {
    logging::init();

    let mut args = std::env::args_os();
    let program = args
        .next()
        .map_or_else(|| String::from("faultload"), |p| p.to_string_lossy().into_owned());
    let (Some(path), None) = (args.next(), args.next()) else {
        eprintln!("Usage: {program} <ELF Executable>");
        return ExitCode::from(1);
    };

    match run_program(&PathBuf::from(path)) {
        Ok(report) => {
            println!("Target return value: {}", report.exit_value);
            println!("Page faults: {}", report.stats.faults);
            println!("Page allocations: {}", report.stats.allocations);
            println!("Internal fragmentation: {} bytes", report.stats.fragmentation_bytes);
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("{err}");
            ExitCode::from(1)
        }
    }
}
