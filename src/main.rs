use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sbtv::settings::Settings;

#[derive(Parser)]
#[command(name = "sbtv")]
#[command(version)]
#[command(about = "Skips sponsored segments on networked YouTube TV devices")]
struct Cli {
    /// Data directory holding the configuration and stats store
    #[arg(short, long, value_name = "DIR")]
    data: Option<PathBuf>,

    /// Raise log verbosity and enable internal loop debugging
    #[arg(long)]
    debug: bool,

    /// Trace outbound requests and responses
    #[arg(long)]
    http_tracing: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(data) = cli.data {
        settings.data_dir = data;
    }
    settings.debug |= cli.debug;
    settings.http_tracing |= cli.http_tracing;

    let default_filter = if settings.debug {
        "sbtv=debug"
    } else {
        "sbtv=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting sbtv v{}", env!("CARGO_PKG_VERSION"));
    info!("using data directory: {}", settings.data_dir.display());

    sbtv::runtime::run(settings).await?;
    Ok(())
}
