use std::process::ExitCode;

use clap::Parser;
use obt_builder::{Config, commands};

#[tokio::main]
async fn main() -> ExitCode {
    monitoring::logging::init();

    let config = Config::parse();

    match commands::build::run(config).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "obt_build_failed");
            ExitCode::FAILURE
        }
    }
}
