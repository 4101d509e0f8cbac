use colored::*;
use grove_runner::{cli, core::aggregate::EXIT_SETUP_ERROR, harness};
use std::process::ExitCode;

fn main() -> ExitCode {
    harness::init_tracing();

    match cli::run() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red(), e);
            ExitCode::from(EXIT_SETUP_ERROR)
        }
    }
}
