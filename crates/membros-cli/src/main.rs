use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use membros_import::{
    ImportConfig, ImportOptions, ImportSummary, LookupBootstrapper, ReportImporter,
    RosterImporter,
};
use membros_storage::StorageConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "membros-cli")]
#[command(about = "Membros roster and report import tools")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import the roster spreadsheet into membros and friendships.
    #[command(name = "membros:import")]
    MembrosImport {
        path: Option<PathBuf>,
        /// Drop all people and friendships first.
        #[arg(long)]
        fresh: bool,
    },
    /// Import a report spreadsheet into reports.
    #[command(name = "reports:import")]
    ReportsImport {
        path: Option<PathBuf>,
        /// Drop all reports first.
        #[arg(long)]
        fresh: bool,
    },
    /// Seed lookups from distinct report values.
    #[command(name = "lookups:bootstrap")]
    LookupsBootstrap,
    Migrate,
    Serve,
}

fn print_summary(label: &str, path: &std::path::Path, summary: &ImportSummary) {
    println!(
        "{label} complete: run_id={} path={} inserted={} updated={} skipped={} friendships={}",
        summary.run_id,
        path.display(),
        summary.inserted,
        summary.updated,
        summary.skipped,
        summary.friendships
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ImportConfig::from_env();
    let storage_config = StorageConfig {
        database_url: config.database_url.clone(),
        ..StorageConfig::from_env()
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::MembrosImport { path, fresh } => {
            let path = path.unwrap_or_else(|| config.sheet_path.clone());
            let pool = membros_storage::connect(&storage_config).await?;
            let summary = RosterImporter::new(pool)
                .run(&path, ImportOptions { fresh })
                .await
                .with_context(|| format!("roster import from {}", path.display()))?;
            print_summary("membros import", &path, &summary);
        }
        Commands::ReportsImport { path, fresh } => {
            let path = path.unwrap_or_else(|| config.sheet_path.clone());
            let pool = membros_storage::connect(&storage_config).await?;
            let summary = ReportImporter::new(pool)
                .run(&path, ImportOptions { fresh })
                .await
                .with_context(|| format!("report import from {}", path.display()))?;
            print_summary("reports import", &path, &summary);
        }
        Commands::LookupsBootstrap => {
            let pool = membros_storage::connect(&storage_config).await?;
            let inserted = LookupBootstrapper::new(pool)
                .run()
                .await
                .context("lookup bootstrap")?;
            println!("lookups bootstrap complete: inserted={inserted}");
        }
        Commands::Migrate => {
            membros_storage::connect(&storage_config)
                .await
                .context("applying migrations")?;
            println!("migrate complete: database_url={}", storage_config.database_url);
        }
        Commands::Serve => {
            membros_web::serve_from_env().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn import_commands_take_optional_path_and_fresh_flag() {
        let cli = Cli::try_parse_from([
            "membros-cli",
            "membros:import",
            "roster.xlsx",
            "--fresh",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::MembrosImport { path, fresh }) => {
                assert_eq!(path, Some(PathBuf::from("roster.xlsx")));
                assert!(fresh);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["membros-cli", "reports:import"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::ReportsImport { path: None, fresh: false })
        ));
        assert!(Cli::try_parse_from(["membros-cli"]).unwrap().command.is_none());
    }
}
