use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use super::{OutputContext, create_spinner};
use crate::config::parse_endpoint;
use tandem_core::backup::{BackupOutcome, OnlineBackup};

#[derive(Args)]
pub struct BackupArgs {
    #[command(subcommand)]
    pub command: BackupCommands,
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Copy the whole store into an empty directory
    Full(BackupTarget),
    /// Bring an existing backup up to date
    Incremental(BackupTarget),
}

#[derive(Args)]
pub struct BackupTarget {
    /// Backup server as host:port
    #[arg(long, conflicts_with = "membership")]
    pub from: Option<String>,

    /// Membership file used to locate the backup server
    #[arg(long)]
    pub membership: Option<PathBuf>,

    /// Member to back up when using --membership; defaults to the master
    #[arg(long)]
    pub machine: Option<i32>,

    /// Destination directory
    #[arg(long)]
    pub to: PathBuf,
}

pub fn execute(args: BackupArgs, output: &OutputContext) -> Result<()> {
    let (full, target) = match args.command {
        BackupCommands::Full(target) => (true, target),
        BackupCommands::Incremental(target) => (false, target),
    };
    let (host, port) = source(&target)?;
    let backup = OnlineBackup::connect(host.clone(), port);

    let kind = if full { "full" } else { "incremental" };
    let spinner = create_spinner(
        &format!("Running {} backup from {}:{}...", kind, host, port),
        output,
    );
    let outcome = if full {
        backup.full(&target.to)
    } else {
        backup.incremental(&target.to)
    };
    spinner.finish_and_clear();

    let outcome = outcome.with_context(|| format!("{} backup into {}", kind, target.to.display()))?;
    print_outcome(kind, &outcome, output)
}

fn source(target: &BackupTarget) -> Result<(String, u16)> {
    if let Some(from) = &target.from {
        return parse_endpoint(from);
    }
    let Some(membership) = &target.membership else {
        bail!("give the backup server with --from or a --membership file");
    };
    let cluster = super::cluster::open(membership)?;
    let machine = match target.machine {
        Some(id) => cluster
            .machines()?
            .into_iter()
            .find(|m| m.machine_id == id)
            .with_context(|| format!("machine {} is not a member", id))?,
        None => cluster.master()?.context("cluster has no master")?,
    };
    let (host, _) = machine.host_and_port()?;
    let port = cluster.backup_port(machine.machine_id)?;
    tracing::info!(
        "Backing up machine {} through {}:{}",
        machine.machine_id,
        host,
        port
    );
    Ok((host, port))
}

fn print_outcome(kind: &str, outcome: &BackupOutcome, output: &OutputContext) -> Result<()> {
    if output.json {
        return output.print_json(outcome);
    }
    output.print_success(&format!(
        "{} backup done in {:.2}s: {} files, {} bytes, {} transactions applied",
        kind,
        outcome.elapsed.as_secs_f64(),
        outcome.files,
        outcome.bytes,
        outcome.transactions
    ));
    if output.verbose {
        let rows = outcome
            .last_applied
            .iter()
            .map(|tx| vec![tx.data_source_name.clone(), tx.tx_id.to_string()])
            .collect();
        output.print_table(&["Data source", "Last tx"], rows);
    }
    Ok(())
}
