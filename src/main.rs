//! Command-line entry point for the safetar binary.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use safetar::error::{ExtractError, UserInputError};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("SAFETAR_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = safetar::cli::Cli::parse();

    if let Err(err) = safetar::run(cli) {
        let mut exit_code = 1;
        for cause in err.chain() {
            if cause.is::<ExtractError>() {
                exit_code = 3;
                break;
            }
            if cause.is::<UserInputError>() {
                exit_code = 2;
                break;
            }
            if cause.is::<std::io::Error>() {
                exit_code = 1;
            }
        }
        eprintln!("safetar: {err:#}");
        std::process::exit(exit_code);
    }
}
