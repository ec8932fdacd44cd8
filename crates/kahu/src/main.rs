use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kahu_bucket::{BucketStore, S3BucketStore};
use kahu_parser::ExtractType;
use kahu_processing::discovery::{discover, DiscoveryOptions};
use kahu_processing::orchestrator::Orchestrator;
use kahu_processing::planner::{plan as build_plan, BatchOrdering, PlanOptions};
use kahu_processing::{EngineConfig, EngineError};
use kahu_repository::{RunRegistry, TriggeredBy};

#[derive(Parser, Debug)]
#[command(author, version, about = "kahu extract warehouse ingestion engine", long_about = None)]
struct Cli {
    /// Path to the engine config file
    #[arg(long, global = true, default_value = "kahu.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List and decode candidate objects without touching the warehouse
    Discover(DiscoverArgs),
    /// Preview the processing plan for the current discoveries
    Plan(PlanArgs),
    /// Execute a full ingestion run
    Run(RunArgs),
    /// Apply warehouse migrations
    Migrate,
}

#[derive(clap::Args, Debug, Clone)]
struct DiscoverArgs {
    /// Only consider these extract types (comma separated)
    #[arg(long, value_delimiter = ',')]
    extracts: Vec<String>,

    /// Ignore files extracted before this feed-local time (YYYY-MM-DDTHH:MM)
    #[arg(long)]
    since: Option<NaiveDateTime>,

    #[arg(long)]
    max_files: Option<usize>,
}

#[derive(clap::Args, Debug, Clone)]
struct PlanArgs {
    #[command(flatten)]
    discover: DiscoverArgs,

    /// Process oldest batches first instead of newest first
    #[arg(long)]
    backfill: bool,

    #[arg(long)]
    max_batches: Option<usize>,
}

#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    plan: PlanArgs,

    /// Record the plan without writing to any warehouse zone
    #[arg(long)]
    dry_run: bool,

    /// Override the configured trigger attribution
    #[arg(long)]
    triggered_by: Option<String>,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    let exit = runtime.block_on(async move {
        match run_command(cli).await {
            Ok(code) => code,
            Err(err) => {
                eprintln!("error: {err:#}");
                // Anything that dies before a run exists is a configuration
                // failure by contract.
                if err.downcast_ref::<EngineError>().is_some() {
                    1
                } else {
                    3
                }
            }
        }
    });

    ExitCode::from(exit as u8)
}

async fn run_command(cli: Cli) -> Result<i32> {
    let config_path = cli.config.exists().then_some(cli.config.as_path());
    if config_path.is_none() {
        warn!(path = %cli.config.display(), "config file not found; using defaults");
    }
    let config = EngineConfig::load(config_path)?;
    config.validate()?;

    match cli.command {
        Command::Discover(args) => discover_command(config, args).await,
        Command::Plan(args) => plan_command(config, args).await,
        Command::Run(args) => run_run(config, args).await,
        Command::Migrate => migrate_command(config).await,
    }
}

async fn connect_registry(config: &EngineConfig) -> Result<RunRegistry> {
    let url = config.database_url()?;
    RunRegistry::connect(url, config.database.max_connections)
        .await
        .context("failed to connect to the warehouse")
}

async fn open_store(config: &EngineConfig) -> Result<Arc<dyn BucketStore>> {
    let store = S3BucketStore::new(config.s3_config())
        .await
        .map_err(|err| EngineError::configuration(format!("object store: {err}")))?;
    Ok(Arc::new(store))
}

fn discovery_options(config: &EngineConfig, args: &DiscoverArgs) -> Result<DiscoveryOptions> {
    let extract_types = if args.extracts.is_empty() {
        None
    } else {
        let mut parsed = Vec::with_capacity(args.extracts.len());
        for name in &args.extracts {
            let extract = ExtractType::parse_name(name).ok_or_else(|| {
                EngineError::configuration(format!("unknown extract type '{name}'"))
            })?;
            parsed.push(extract);
        }
        Some(parsed)
    };

    Ok(DiscoveryOptions {
        extract_types,
        extracted_after: args.since,
        extracted_before: None,
        max_files: args
            .max_files
            .or(Some(config.discovery.max_files_per_batch)),
    })
}

fn plan_options(config: &EngineConfig, args: &PlanArgs) -> PlanOptions {
    PlanOptions {
        ordering: if args.backfill {
            BatchOrdering::Backfill
        } else {
            BatchOrdering::Latest
        },
        priority_extracts: config.priority_extracts(),
        max_batches: args.max_batches,
    }
}

async fn discover_command(config: EngineConfig, args: DiscoverArgs) -> Result<i32> {
    let store = open_store(&config).await?;
    let options = discovery_options(&config, &args)?;
    let outcome = discover(store.as_ref(), &config, &options).await?;

    let preview: Vec<serde_json::Value> = outcome
        .files
        .iter()
        .map(|file| {
            serde_json::json!({
                "key": file.meta.key,
                "extract_type": file.parsed.extract_type.canonical_name(),
                "batch_id": file.parsed.batch_id,
                "per_org_id": file.parsed.per_org_id,
                "practice_id": file.parsed.practice_id,
                "is_full_load": file.parsed.is_full_load,
                "size": file.meta.size,
                "version_id": file.version_id(),
                "identity_hash": file.identity_hash,
            })
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "files": preview,
            "skipped": outcome.skipped,
            "warnings": outcome.warnings,
        }))?
    );
    Ok(0)
}

async fn plan_command(config: EngineConfig, args: PlanArgs) -> Result<i32> {
    let store = open_store(&config).await?;
    let options = discovery_options(&config, &args.discover)?;
    let outcome = discover(store.as_ref(), &config, &options).await?;
    let plan = build_plan(outcome.files, &plan_options(&config, &args));

    let batches: Vec<serde_json::Value> = plan
        .batches
        .iter()
        .map(|batch| {
            serde_json::json!({
                "batch_id": batch.batch_id,
                "files": batch.files.iter().map(|f| f.file.meta.key.clone()).collect::<Vec<_>>(),
                "extract_types": batch.extract_types.iter().map(|e| e.canonical_name()).collect::<Vec<_>>(),
                "total_bytes": batch.total_bytes,
                "complete": batch.complete,
            })
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "batches": batches,
            "total_files": plan.total_files,
            "warnings": plan.warnings,
        }))?
    );
    Ok(0)
}

async fn run_run(mut config: EngineConfig, args: RunArgs) -> Result<i32> {
    if let Some(trigger) = &args.triggered_by {
        config.engine.triggered_by = TriggeredBy::from_str(trigger).ok_or_else(|| {
            EngineError::configuration(format!("unknown trigger '{trigger}'"))
        })?;
    }

    let store = open_store(&config).await?;
    let registry = connect_registry(&config).await?;

    let options = discovery_options(&config, &args.plan.discover)?;
    let outcome = discover(store.as_ref(), &config, &options).await?;
    for warning in &outcome.warnings {
        warn!(warning = %warning, "discovery warning");
    }
    let plan = build_plan(outcome.files, &plan_options(&config, &args.plan));
    info!(
        files = plan.total_files,
        batches = plan.batches.len(),
        "plan ready"
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; draining in-flight work");
            let _ = cancel_tx.send(true);
        }
    });

    let orchestrator = Orchestrator {
        store,
        registry: Arc::new(registry),
        config: Arc::new(config),
    };
    let receipt = match orchestrator.execute(plan, args.dry_run, cancel_rx).await {
        Ok(receipt) => receipt,
        Err(err @ EngineError::Configuration { .. }) | Err(err @ EngineError::Schema(_)) => {
            return Err(err.into());
        }
        Err(err) => {
            eprintln!("run failed: {err}");
            return Ok(3);
        }
    };

    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(receipt.outcome.exit_code())
}

async fn migrate_command(config: EngineConfig) -> Result<i32> {
    let registry = connect_registry(&config).await?;
    registry.run_migrations().await?;
    info!("migrations applied");
    Ok(0)
}
