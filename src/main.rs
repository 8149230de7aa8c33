use std::process::ExitCode;

use pgproxy::config::Config;
use pgproxy::server::{install_shutdown_handler, Server};

fn main() -> ExitCode {
    pgproxy::init_tracing();

    let config = match Config::from_args(std::env::args().skip(1)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = install_shutdown_handler() {
        eprintln!("failed to install signal handler: {}", e);
        return ExitCode::FAILURE;
    }

    let mut server = match Server::new(&config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run() {
        eprintln!("fatal error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
