use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use clubsync_migrate::{report, YearSelection};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "clubsync")]
#[command(about = "Reconciles legacy club records into the canonical database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import every configured year, or a single one.
    Run {
        #[arg(long)]
        year: Option<i32>,
        /// Execute every decision but write nothing to the canonical store.
        #[arg(long)]
        dry_run: bool,
        /// Read legacy tables from JSON fixtures instead of the legacy database.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Apply the canonical schema migrations.
    Schema,
    /// Drop the tournament table of one migrated year from the legacy database.
    Cleanup {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        confirm: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        year: None,
        dry_run: false,
        fixtures: None,
    }) {
        Commands::Run {
            year,
            dry_run,
            fixtures,
        } => {
            let years = year.map_or(YearSelection::All, YearSelection::Single);
            let summary = clubsync_migrate::run_from_env(years, dry_run, fixtures).await?;
            println!("{}", report::render_markdown(&summary));
            println!(
                "migration complete: run_id={} dry_run={} conflicts={} ambiguous={} reports={}",
                summary.run_id,
                summary.dry_run,
                summary.conflicts.len(),
                summary.ambiguities.len(),
                summary
                    .reports_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            let failed = summary.failed_years();
            if !failed.is_empty() {
                bail!("years failed: {failed:?}");
            }
        }
        Commands::Schema => {
            clubsync_migrate::apply_schema_from_env().await?;
            println!("canonical schema applied");
        }
        Commands::Cleanup { year, confirm } => {
            if !confirm {
                bail!("refusing to drop legacy partition {year} without --confirm");
            }
            if clubsync_migrate::cleanup_year_from_env(year).await? {
                println!("dropped legacy partition gare_{year}");
            } else {
                println!("legacy partition gare_{year} not present");
            }
        }
    }

    Ok(())
}
