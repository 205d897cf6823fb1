use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::OutputContext;
use tandem_core::cluster::{ClusterClient, DEFAULT_SESSION_TIMEOUT, Membership, StaticCoordinator};

#[derive(Args)]
pub struct ClusterArgs {
    /// Membership file; defaults to `membership_file` from the configuration
    #[arg(long, global = true, env = "TANDEM_MEMBERSHIP_FILE")]
    pub membership: Option<PathBuf>,

    #[command(subcommand)]
    pub command: ClusterCommands,
}

#[derive(Subcommand)]
pub enum ClusterCommands {
    /// Show the current master
    Master,
    /// List every member except the master
    Slaves,
    /// List every member
    Members,
}

pub fn execute(config: Option<&Path>, args: ClusterArgs, output: &OutputContext) -> Result<()> {
    let path = match args.membership {
        Some(path) => path,
        None => crate::config::load(config)?
            .membership_file
            .context("no membership file given (use --membership)")?,
    };
    let cluster = open(&path)?;

    match args.command {
        ClusterCommands::Master => {
            let Some(master) = cluster.master()? else {
                bail!("cluster {} has no master", cluster.cluster_name());
            };
            output.print_machines(std::slice::from_ref(&master))
        }
        ClusterCommands::Slaves => {
            let slaves = cluster.connected_slaves()?;
            if slaves.is_empty() {
                output.print_info("No slaves");
                if !output.json {
                    return Ok(());
                }
            }
            output.print_machines(&slaves)
        }
        ClusterCommands::Members => output.print_machines(&cluster.machines()?),
    }
}

pub(crate) fn open(path: &Path) -> Result<ClusterClient> {
    let membership = Membership::load(path)
        .with_context(|| format!("reading membership from {}", path.display()))?;
    let coordinator = Arc::new(StaticCoordinator::new(&membership)?);
    let cluster = ClusterClient::new(
        coordinator,
        membership.cluster_name.clone(),
        DEFAULT_SESSION_TIMEOUT,
    );
    cluster.wait_for_sync_connected()?;
    tracing::debug!(
        "Loaded cluster {} with {} members",
        membership.cluster_name,
        membership.machines.len()
    );
    Ok(cluster)
}
