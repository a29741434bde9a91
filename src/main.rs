use std::process::ExitCode;

fn main() -> ExitCode {
    eyestate::run_cli()
}
