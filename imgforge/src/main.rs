use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use imgforge::commands;
use imgforge::{Cli, Commands};

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Manifest(args) => commands::manifest::run(args),
        Commands::ListImages(args) => commands::list_images::run(args),
        Commands::GenPartitionTable(args) => commands::gen_partition_table::run(args),
        Commands::GenPartitionStages(args) => commands::gen_partition_stages::run(args),
        Commands::Inspect(args) => commands::inspect::run(args),
        Commands::Build(args) => commands::build::run(args),
        Commands::Schema(args) => commands::schema::run(args),
        Commands::Completions(args) => commands::completions::run(args),
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
