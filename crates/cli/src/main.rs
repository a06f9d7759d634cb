use std::process::ExitCode;

fn main() -> ExitCode {
    adloop_cli::run()
}
