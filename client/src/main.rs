mod cli;

use clap::Parser;
use std::{env, io, process::ExitCode};

const DEFAULT_LOG_FILTER: &str = "mp_blat=info,master=info,worker=info,common=info";

#[tokio::main]
async fn main() -> ExitCode {
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    // errores de uso salen con código 2
    let cli = cli::Cli::parse();
    cli::run(cli).await
}
