use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use isla_sync::{
    export_facts, load_name_index, open_durable_store, report_runs_markdown, MatchMethod, PipelineResult, SyncConfig,
    SyncService, Workspace,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "isla")]
#[command(about = "Municipal open-data ingestion: bronze, silver and gold layers")]
struct Cli {
    /// Print results as JSON instead of one line per dataset.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline for one dataset.
    Run { dataset: String },
    /// Run every enabled dataset in turn.
    RunAll,
    /// Resolve a free-text municipality name against the registry.
    Resolve { name: String },
    /// Show recent runs and their steps.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Write a dataset's fact table to Parquet.
    ExportFacts {
        dataset: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Serve the run ledger as JSON.
    Serve,
    /// Run every enabled dataset on the configured cron until interrupted.
    Schedule,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

fn print_results(results: &[PipelineResult], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results).context("serializing results")?);
    } else {
        for result in results {
            let summary = &result.summary;
            println!(
                "{}: {} run_id={} fetched={} bronze={} accepted={} rejected={} unresolved={} silver_inserted={} silver_updated={} silver_errors={}{}",
                result.dataset_id,
                if result.success { "completed" } else { "failed" },
                result.run_id,
                summary.fetch.rows,
                summary.bronze.inserted,
                summary.transform.accepted,
                summary.transform.rejected_total(),
                summary.transform.unresolved,
                summary.silver.inserted,
                summary.silver.updated,
                summary.silver.errors,
                result.error.as_deref().map(|e| format!(" error={e}")).unwrap_or_default(),
            );
        }
    }
    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        bail!("{failed} of {} dataset run(s) failed", results.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::RunAll) {
        Commands::Run { dataset } => {
            let service = SyncService::from_config(&config).await?;
            let result = service.run_dataset(&dataset).await?;
            print_results(&[result], cli.json)?;
        }
        Commands::RunAll => {
            let service = SyncService::from_config(&config).await?;
            let results = service.run_all().await;
            print_results(&results, cli.json)?;
        }
        Commands::Resolve { name } => {
            let index = load_name_index(&config).await?;
            match index.resolve_match(&name) {
                Some(found) if cli.json => println!("{}", serde_json::to_string_pretty(&found)?),
                Some(found) => {
                    let method = match found.method {
                        MatchMethod::Exact => "exact".to_string(),
                        MatchMethod::Fallback { score } => format!("fallback (score {score})"),
                    };
                    println!("{} -> {} {} [{method}]", name, found.code, found.canonical_name);
                }
                None => {
                    let hint = index
                        .suggest(&name)
                        .map(|(closest, similarity)| format!("; closest registry name: {closest} ({similarity:.2})"))
                        .unwrap_or_default();
                    bail!("{name} is unresolved{hint}");
                }
            }
        }
        Commands::Runs { limit } => {
            let store = open_durable_store(&config, "listing runs").await?;
            print!("{}", report_runs_markdown(store.ledger(), limit).await?);
        }
        Commands::ExportFacts { dataset, out } => {
            let workspace = Workspace::load(&config).await?;
            let descriptor = workspace
                .catalog
                .get(&dataset)
                .with_context(|| format!("dataset {dataset} is not declared in the catalog"))?;
            let out = out.unwrap_or_else(|| {
                config
                    .artifacts_dir
                    .clone()
                    .unwrap_or_else(|| config.workspace_root.join("artifacts"))
                    .join("exports")
            });
            let store = open_durable_store(&config, "exporting facts").await?;
            let manifest = export_facts(store.persistence(), descriptor, &out).await?;
            println!("facts exported: manifest={}", manifest.display());
        }
        Commands::Serve => {
            isla_web::serve(&config).await?;
        }
        Commands::Schedule => {
            let service = SyncService::from_config(&config).await?;
            let Some(sched) = service.maybe_build_scheduler(&config).await? else {
                bail!("scheduler is disabled; set ISLA_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}
