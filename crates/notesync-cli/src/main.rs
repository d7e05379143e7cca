use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use notesync_core::SourceKind;
use notesync_sync::{build_scraper, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "notesync")]
#[command(about = "Social note ingestion and dual-store sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One pass over every enabled source in sources.yaml.
    Sync,
    /// Run passes on SYNC_CRON until interrupted.
    Schedule,
    /// Scrape the given keys for one source.
    Scrape {
        #[arg(value_enum)]
        source: SourceArg,
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
        #[arg(long)]
        pages: Option<u32>,
    },
    /// List document-store collections.
    Collections,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Xhs,
    Gzh,
}

impl From<SourceArg> for SourceKind {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Xhs => SourceKind::Xhs,
            SourceArg::Gzh => SourceKind::Gzh,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("notesync=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = notesync_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} drivers={} failed={} keys={}",
                summary.run_id, summary.drivers, summary.drivers_failed, summary.keys
            );
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = SyncPipeline::new(config);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Scrape {
            source,
            keys,
            pages,
        } => {
            let config = SyncConfig::from_env();
            let scraper = build_scraper(&config, source.into(), pages).await?;
            scraper.scrape_all(&keys).await;
            println!("scrape finished: source={} keys={}", scraper.source(), keys.len());
        }
        Commands::Collections => {
            for name in notesync_sync::list_collections_from_env().await? {
                println!("{name}");
            }
        }
    }

    Ok(())
}
