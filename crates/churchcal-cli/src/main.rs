use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Local, NaiveDate};
use churchcal_adapters::FixtureEventSource;
use churchcal_sync::{
    run_import_once_from_env, run_scheduler_until_shutdown, ImportPipeline, ImportRunSummary,
    SyncConfig,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "churchcal")]
#[command(about = "Import ChurchTools calendar events and render upcoming appointments")]
struct Cli {
    /// Log filter, e.g. `info` or `churchcal_sync=debug`.
    #[arg(long, env = "RUST_LOG", default_value = "info", global = true)]
    log: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one import cycle.
    Import {
        /// Import a saved `getCalendarEvents` response instead of calling the API.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Create the event table and run the first import.
    Activate,
    /// Drop the event table and every imported event.
    Deactivate,
    /// Run the import schedule until interrupted.
    Schedule,
    /// Serve the appointments page.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the appointments fragment to stdout.
    Render {
        #[arg(long)]
        today: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();

    match cli.command.unwrap_or(Commands::Import { fixture: None }) {
        Commands::Import { fixture: None } => {
            print_summary("import", &run_import_once_from_env().await?);
        }
        Commands::Import {
            fixture: Some(path),
        } => {
            let config = SyncConfig::from_env()?;
            let store = config.open_store().await?;
            let pipeline =
                ImportPipeline::new(config, store, Box::new(FixtureEventSource::new(path)));
            print_summary("import", &pipeline.run_once().await?);
        }
        Commands::Activate => {
            let pipeline = ImportPipeline::from_config(SyncConfig::from_env()?).await?;
            print_summary("activate", &pipeline.activate().await?);
        }
        Commands::Deactivate => {
            let pipeline = ImportPipeline::from_config(SyncConfig::from_env()?).await?;
            pipeline.deactivate().await?;
            info!(table = pipeline.store().table().as_str(), "event table dropped");
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env()?;
            config.scheduler_enabled = true;
            let pipeline = ImportPipeline::from_config(config).await?;
            run_scheduler_until_shutdown(Arc::new(pipeline)).await?;
        }
        Commands::Serve { port } => {
            churchcal_web::serve_from_env(port).await?;
        }
        Commands::Render { today } => {
            let config = SyncConfig::from_env()?;
            let store = config.open_store().await?;
            let today = today.unwrap_or_else(|| Local::now().date_naive());
            let appointments =
                churchcal_web::load_appointments(&store, today, config.weeks).await?;
            println!("{}", churchcal_web::render_appointments(appointments)?);
        }
    }

    Ok(())
}

fn print_summary(command: &str, summary: &ImportRunSummary) {
    println!(
        "{command} complete: run_id={} source={} fetched={} skipped={} inserted={} pruned={}",
        summary.run_id,
        summary.source_id,
        summary.fetched_records,
        summary.skipped_records,
        summary.inserted,
        summary.pruned
    );
}
