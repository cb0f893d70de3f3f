use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use flash_sale_watcher::config::LoggingConfig;
use flash_sale_watcher::scheduler::WatchScheduler;
use flash_sale_watcher::scraper::ChromeFetcher;
use flash_sale_watcher::{AppConfig, Pipeline, SqliteProductStore};

#[derive(Parser)]
#[command(name = "flash-sale-watcher", version, about = "Scrapes limited-time sale offers into SQLite")]
struct Cli {
    /// Configuration file; defaults to config/{default,$RUN_MODE,local} plus environment
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline once and print the outcome as JSON
    Run,
    /// Run the pipeline on the configured cron schedule until Ctrl-C
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::from_env()?,
    };

    let _guard = init_tracing(&config.logging)?;

    info!("Starting flash sale watcher...");

    let store = SqliteProductStore::connect(&config.database).await?;
    let fetcher = ChromeFetcher::new(config.scraper.clone());
    let pipeline = Arc::new(Pipeline::new(&config, Arc::new(fetcher), Arc::new(store))?);

    match cli.command {
        Command::Run => {
            let outcome = pipeline.run().await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Schedule => {
            let mut scheduler = WatchScheduler::new(pipeline, config.scheduler.clone()).await?;
            scheduler.start().await?;

            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");
            scheduler.shutdown().await?;
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("flash_sale_watcher=info".parse()?);

    let (file_layer, guard) = match &logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &logging.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}
