use anyhow::Result;
use clap::Parser;
use tandem_cli::Cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "tandem_core=warn,tandem_cli=warn",
        1 => "tandem_core=info,tandem_cli=info",
        _ => "tandem_core=debug,tandem_cli=debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tandem_cli::run(cli)
}
