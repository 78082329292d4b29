use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dip_core::ExtractionOutcome;
use dip_manager::ProfileOptions;
use dip_storage::PgProfileStore;
use dip_sync::{BatchOptions, DipConfig, ProfileOrchestrator, StoreKind};
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "dip")]
#[command(about = "Domain intelligence profile cache")]
struct Cli {
    /// YAML config file; `DIP_*` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the extraction decision for a URL.
    Decide {
        url: String,
        #[arg(long)]
        force_refresh: bool,
    },
    /// Record an extraction outcome for a domain.
    Feedback {
        domain: String,
        #[arg(long)]
        duration_ms: u64,
        #[arg(long)]
        failed: bool,
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long)]
        cost: Option<f64>,
    },
    /// Print stored profiles, as summaries or full documents.
    Export {
        domain: Option<String>,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        full: bool,
    },
    /// Import profile documents from a JSON file (one object or an array).
    Import { path: PathBuf },
    /// Warm profiles for many domains.
    Batch {
        domains: Vec<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        force_refresh: bool,
    },
    /// Run one optimization pass.
    Optimize,
    Health,
    /// Serve the JSON admin API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8700")]
        addr: SocketAddr,
    },
    /// Apply PostgreSQL migrations.
    Migrate,
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);
    let config = DipConfig::load(cli.config.as_deref())?;

    let orchestrator = Arc::new(ProfileOrchestrator::from_config(config).await?);

    match cli.command {
        Commands::Decide { url, force_refresh } => {
            let options = ProfileOptions {
                force_refresh,
                ..ProfileOptions::default()
            };
            print_json(&orchestrator.get_profile_for_extraction(&url, &options).await)?;
        }
        Commands::Feedback {
            domain,
            duration_ms,
            failed,
            strategy,
            cost,
        } => {
            let outcome = ExtractionOutcome {
                success: !failed,
                duration_ms,
                strategy,
                cost,
            };
            match orchestrator.update_from_extraction(&domain, &outcome).await {
                Some(profile) => print_json(&profile.performance_metrics)?,
                None => bail!("no profile updated for {domain}"),
            }
        }
        Commands::Export { domain, all, full } => {
            let domains = match (domain, all) {
                (_, true) => orchestrator.list_domains().await?,
                (Some(domain), false) => vec![domain],
                (None, false) => bail!("pass a domain or --all"),
            };
            let mut out = Vec::with_capacity(domains.len());
            for domain in &domains {
                let value = if full {
                    orchestrator.export_full(domain).await.map(serde_json::to_value)
                } else {
                    orchestrator.export_dip(domain).await.map(serde_json::to_value)
                };
                match value {
                    Some(value) => out.push(value?),
                    None => warn!(domain = %domain, "no profile to export"),
                }
            }
            print_json(&out)?;
        }
        Commands::Import { path } => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let payload: Value = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            let documents = match payload {
                Value::Array(items) => items,
                other => vec![other],
            };
            let mut imported = 0;
            for document in &documents {
                if orchestrator.import_dip(document).await {
                    imported += 1;
                }
            }
            println!("imported {imported}/{}", documents.len());
            if imported < documents.len() {
                bail!("{} profile(s) rejected", documents.len() - imported);
            }
        }
        Commands::Batch {
            mut domains,
            file,
            batch_size,
            force_refresh,
        } => {
            if let Some(file) = file {
                let raw = tokio::fs::read_to_string(&file)
                    .await
                    .with_context(|| format!("reading {}", file.display()))?;
                domains.extend(
                    raw.lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(str::to_string),
                );
            }
            let options = BatchOptions {
                batch_size: batch_size.unwrap_or(orchestrator.config().batch_size),
                force_refresh,
            };
            print_json(&orchestrator.batch_process_domains(&domains, &options).await)?;
        }
        Commands::Optimize => match orchestrator.optimize().await {
            Some(report) => print_json(&report)?,
            None => bail!("an optimization pass is already running"),
        },
        Commands::Health => print_json(&orchestrator.get_system_health().await)?,
        Commands::Serve { addr } => {
            orchestrator.start().await?;
            tokio::select! {
                result = dip_web::serve(addr, Arc::clone(&orchestrator)) => result?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
            orchestrator.stop_auto_optimization().await?;
        }
        Commands::Migrate => {
            let config = orchestrator.config();
            if config.store != StoreKind::Postgres {
                bail!("migrate requires DIP_STORE=postgres");
            }
            let store = PgProfileStore::connect(&config.database_url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
    }

    Ok(())
}
