use std::process::ExitCode;

fn main() -> ExitCode {
    reimburse_cli::run()
}
