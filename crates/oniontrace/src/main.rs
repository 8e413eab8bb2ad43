//! Binary entry point for `oniontrace`.

use std::process::ExitCode;

fn main() -> ExitCode {
    oniontrace::main_main(std::env::args().skip(1))
}
