use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rupsync_sync::{build_engine, Page, PgSinkStore, SyncConfig};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rupsync")]
#[command(about = "SPSE/SIRUP procurement sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one table, or every enabled endpoint.
    Sync {
        #[arg(long)]
        table: Option<String>,
    },
    /// Enrich one planning code, or every package still lacking detail.
    Enrich {
        #[arg(long)]
        kode_rup: Option<String>,
    },
    /// Live row counts per table.
    Stats,
    /// List live rows of one table, newest first.
    Records {
        #[arg(long)]
        table: String,
        #[arg(long)]
        offset: Option<i64>,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Create missing tables and indexes.
    Migrate,
    /// Serve the JSON API.
    Serve,
}

fn init_tracing() {
    let level = std::env::var("RUPSYNC_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("RUPSYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { table: None }) {
        Commands::Sync { table: Some(table) } => {
            let engine = build_engine(&config).await?;
            match engine.run_cycle(&table).await {
                Ok(report) => print_json(&report)?,
                Err(failure) => {
                    print_json(&failure.summary())?;
                    bail!(failure);
                }
            }
        }
        Commands::Sync { table: None } => {
            let engine = build_engine(&config).await?;
            let report = engine.run_all().await;
            print_json(&report)?;
            if report.tables_succeeded < report.tables_total {
                bail!(
                    "{} of {} tables failed to sync",
                    report.tables_total - report.tables_succeeded,
                    report.tables_total
                );
            }
        }
        Commands::Enrich { kode_rup: Some(kode_rup) } => {
            let engine = build_engine(&config).await?;
            print_json(&engine.enrich_one(&kode_rup).await?)?;
        }
        Commands::Enrich { kode_rup: None } => {
            let engine = build_engine(&config).await?;
            print_json(&engine.enrich_all().await?)?;
        }
        Commands::Stats => {
            let engine = build_engine(&config).await?;
            print_json(&engine.counts().await?)?;
        }
        Commands::Records {
            table,
            offset,
            limit,
        } => {
            let engine = build_engine(&config).await?;
            print_json(&engine.list_records(&table, Page::new(offset, limit)).await?)?;
        }
        Commands::Migrate => {
            let store = PgSinkStore::connect(&config.database_url).await?;
            let statements = store.ensure_schema().await?;
            info!(statements, "migration complete");
        }
        Commands::Serve => rupsync_web::serve(&config).await?,
    }

    Ok(())
}
