mod artifacts;
mod cli;
mod cluster;
mod commands;
mod error;
mod facets;
mod model;
mod reduce;
mod semantic;
mod table;
mod util;
mod vectors;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Embed(args) => commands::embed::run(args),
        Commands::Reduce(args) => commands::reduce::run(args),
        Commands::Cluster(args) => commands::cluster::run(args),
        Commands::Facets(args) => commands::facets::run(args),
        Commands::Pipeline(args) => commands::pipeline::run(args),
        Commands::Status(args) => commands::status::run(args),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
