use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::OutputContext;
use crate::config::parse_endpoint;
use tandem_core::backup::{BackupImpl, BackupServer};
use tandem_core::server::Server;
use tandem_core::slave::copy_store_from_master;
use tandem_core::store_id::STORE_ID_FILE;
use tandem_core::{
    Database, MasterClient, MasterImpl, MasterServer, ReplicationConfig, SlaveSession,
};

#[derive(Args)]
pub struct ServeArgs {
    /// Follow the master at host:port instead of serving as master
    #[arg(long)]
    pub master: Option<String>,

    /// Seconds between pulls (slave) or stats lines (master)
    #[arg(long, default_value_t = 5)]
    pub interval: u64,

    /// Override the store directory
    #[arg(long)]
    pub store_dir: Option<std::path::PathBuf>,

    /// Override the machine id
    #[arg(long)]
    pub machine_id: Option<i32>,
}

pub fn execute(config: Option<&Path>, args: ServeArgs, output: &OutputContext) -> Result<()> {
    let mut config = crate::config::load(config)?;
    if let Some(dir) = args.store_dir {
        config.store_dir = dir;
    }
    if let Some(id) = args.machine_id {
        config.machine_id = id;
    }
    let interval = Duration::from_secs(args.interval.max(1));

    match args.master {
        Some(endpoint) => serve_slave(&config, &endpoint, interval, output),
        None => serve_master(&config, interval, output),
    }
}

fn serve_master(config: &ReplicationConfig, interval: Duration, output: &OutputContext) -> Result<()> {
    let database = Arc::new(open_database(&config.store_dir)?);
    let master = Arc::new(
        MasterImpl::new(config.machine_id, database.clone())
            .with_lock_timeout(config.lock_timeout())
            .with_id_grab_size(config.id_grab_size),
    );
    let server = Server::start(
        Arc::new(MasterServer::new(master.clone())),
        config.master_addr,
        config.server_config(),
    )
    .with_context(|| format!("binding master server to {}", config.master_addr))?;
    let _backup = start_backup(config, &database)?;

    output.print_success(&format!(
        "Machine {} serving as master on {} (store {})",
        config.machine_id,
        server.local_addr(),
        database.store_id()
    ));

    loop {
        std::thread::sleep(interval);
        let stats = master.stats();
        tracing::info!(
            "commits={} pulls={} sessions={} open_tx={} locks_denied={} connections={}",
            stats.commits,
            stats.pulls,
            stats.sessions,
            stats.open_transactions,
            stats.locks_denied,
            server.connection_count()
        );
        if output.json {
            output.print_json(&stats)?;
        }
    }
}

fn serve_slave(
    config: &ReplicationConfig,
    endpoint: &str,
    interval: Duration,
    output: &OutputContext,
) -> Result<()> {
    let (host, port) = parse_endpoint(endpoint)?;
    let client = MasterClient::connect(host, port, config.machine_id);

    let database = if config.store_dir.join(STORE_ID_FILE).is_file() {
        open_database(&config.store_dir)?
    } else {
        output.print_info(&format!("Copying store from {}", client.describe()));
        copy_store_from_master(&client, &config.store_dir)
            .with_context(|| format!("copying store from {}", client.describe()))?
    };
    let session = SlaveSession::new(config.machine_id, Arc::new(database));
    session
        .check_consistency_with_master(&client)
        .context("local store does not match the master")?;
    let _backup = start_backup(config, session.database())?;

    output.print_success(&format!(
        "Machine {} following {} at tx {}",
        config.machine_id,
        client.describe(),
        session.database().main_data_source().last_committed_tx()
    ));

    loop {
        std::thread::sleep(interval);
        match session.pull_updates(&client) {
            Ok(()) => tracing::debug!(
                "Pulled up to tx {}",
                session.database().main_data_source().last_committed_tx()
            ),
            Err(e) if e.is_retryable() => {
                tracing::warn!("Pull from {} failed: {}", client.describe(), e);
                client.close_idle();
            }
            Err(e) => return Err(e).context("pulling updates"),
        }
    }
}

fn open_database(store_dir: &Path) -> Result<Database> {
    Database::open(store_dir).with_context(|| format!("opening store {}", store_dir.display()))
}

fn start_backup(config: &ReplicationConfig, database: &Arc<Database>) -> Result<Option<Server>> {
    if !config.backup_enabled {
        return Ok(None);
    }
    let backup = Arc::new(BackupImpl::new(database.clone()));
    let server = Server::start(
        Arc::new(BackupServer::new(backup)),
        config.backup_addr,
        config.server_config(),
    )
    .with_context(|| format!("binding backup server to {}", config.backup_addr))?;
    tracing::info!("Backup server listening on {}", server.local_addr());
    Ok(Some(server))
}
