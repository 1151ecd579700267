use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dqm")]
#[command(about = "Dataset quality mirror command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load the local mirror from the remote catalog.
    Load,
    /// Delete every mirrored row, reports included.
    Drop,
    /// Generate dataset quality reports for every mirrored triple.
    Report,
    /// Run pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Load => {
            let summary = dqm_sync::load_from_env().await?;
            println!(
                "load complete: organisations={} issue_types={} resources={} organisation_links={} collections={} datasets={} dataset_links={}",
                summary.organisations,
                summary.issue_types,
                summary.resources,
                summary.organisation_links,
                summary.collections,
                summary.datasets,
                summary.dataset_links
            );
        }
        Commands::Drop => {
            let dropped = dqm_sync::drop_from_env().await?;
            println!(
                "drop complete: organisations={} resources={} datasets={} reports={} issues={}",
                dropped.organisations,
                dropped.resources,
                dropped.datasets,
                dropped.reports,
                dropped.issues
            );
        }
        Commands::Report => {
            let summary = dqm_sync::report_from_env().await?;
            println!(
                "report complete: run_id={} triples={} reported={} skipped={} failed={}",
                summary.run_id, summary.triples, summary.reported, summary.skipped, summary.failed
            );
        }
        Commands::Migrate => {
            dqm_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
