//! sluice utility - main entrypoint

use std::process::ExitCode;

fn main() -> ExitCode {
    sluice::main(std::env::args_os())
}
