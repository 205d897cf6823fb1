//! Tandem command-line interface
//!
//! `tandem serve` runs a master (or a slave following one) with its backup
//! server, `tandem backup` takes online backups and `tandem cluster` inspects
//! a membership file.

pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{OutputContext, backup, cluster, serve};
use std::path::PathBuf;

/// Command-line interface for Tandem replication, backup and cluster inspection
#[derive(Parser)]
#[command(name = "tandem")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "TANDEM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose output; repeat for debug logs
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand)]
pub enum Commands {
    /// Serve the master protocol and online backups
    Serve(serve::ServeArgs),
    /// Online backups
    Backup(backup::BackupArgs),
    /// Cluster membership queries
    Cluster(cluster::ClusterArgs),
}

/// Execute a parsed command line
pub fn run(cli: Cli) -> Result<()> {
    let output = OutputContext {
        json: cli.json,
        verbose: cli.verbose > 0,
    };
    match cli.command {
        Commands::Serve(args) => serve::execute(cli.config.as_deref(), args, &output),
        Commands::Backup(args) => backup::execute(args, &output),
        Commands::Cluster(args) => cluster::execute(cli.config.as_deref(), args, &output),
    }
}
