use anyhow::{Context, Result};
use chronokv_core::store::{DEFAULT_MAP_SIZE, Store, StoreOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{OutputContext, data, nodes};

/// Command-line tool for chronokv stores
#[derive(Parser)]
#[command(name = "chronokv")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Store directory
    #[arg(long, short = 'd', env = "CHRONOKV_DATABASE")]
    pub database: PathBuf,

    /// LMDB map size in bytes
    #[arg(long, env = "CHRONOKV_MAP_SIZE", default_value_t = DEFAULT_MAP_SIZE)]
    pub map_size: usize,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Read and print keys and values as hex
    #[arg(long)]
    pub hex: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the live value of a key
    Get(data::GetArgs),
    /// Write a value
    Put(data::PutArgs),
    /// Delete a key
    Del(data::DelArgs),
    /// List the live keys of a table
    Scan(data::ScanArgs),
    /// Print the mutation log
    Log(data::LogArgs),
    /// Peer registry
    Nodes(nodes::NodesArgs),
    /// Print the backlog of a peer
    Pending(nodes::PendingArgs),
    /// Store-wide counters
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            "chronokv=debug".into()
        } else {
            "chronokv=warn".into()
        }
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store = Store::open(
        &cli.database,
        StoreOptions::default().with_map_size(cli.map_size),
    )
    .with_context(|| format!("failed to open store at {}", cli.database.display()))?;
    debug!(database = %cli.database.display(), origin = store.origin(), "store opened");

    let output = OutputContext {
        json: cli.json,
        hex: cli.hex,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Get(args) => data::get(&store, args, &output),
        Commands::Put(args) => data::put(&store, args, &output),
        Commands::Del(args) => data::del(&store, args, &output),
        Commands::Scan(args) => data::scan(&store, args, &output),
        Commands::Log(args) => data::log(&store, args, &output),
        Commands::Nodes(args) => nodes::execute(&store, args, &output),
        Commands::Pending(args) => nodes::pending(&store, args, &output),
        Commands::Stats => nodes::stats(&store, &output),
    }
}
