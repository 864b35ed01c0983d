#![forbid(unsafe_code)]

//! nerve: node-local health-check agent entry point.

use clap::Parser;

mod cli_app;

fn main() {
    let args = cli_app::Cli::parse();
    cli_app::init_logging(&args);
    if let Err(e) = cli_app::run(&args) {
        eprintln!("nerve: {e}");
        std::process::exit(e.exit_code());
    }
}
