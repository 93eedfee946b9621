use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dataaging::{
    AgingRunner, CancelToken, CopyId, EngineConfig, InMemoryCatalog, PassStatus, PolicyId,
    PolicyStore, assign_cycles, evaluate, spawn_schedule,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dataaging")]
#[command(about = "Retention and data aging over a JSON storage catalog")]
struct Cli {
    /// Catalog file holding policies, jobs and checkpoints.
    #[arg(long, global = true, default_value = "catalog.json")]
    catalog: PathBuf,

    /// Engine configuration file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one aging pass per policy and write the outcome back to the catalog.
    Run {
        /// Policies to age; all policies in the catalog when omitted.
        #[arg(long = "policy")]
        policies: Vec<u64>,
        /// Evaluate retention as of this RFC 3339 timestamp.
        #[arg(long)]
        now: Option<DateTime<Utc>>,
        /// Report what would be aged without saving the catalog.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the retention decision for one copy. Nothing is committed.
    Evaluate {
        #[arg(long)]
        policy: u64,
        #[arg(long)]
        copy: u64,
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
    /// Show how a copy's jobs group into cycles.
    Cycles {
        #[arg(long)]
        copy: u64,
    },
    /// Show usage and eviction state of every cache-tier copy.
    Usage {
        /// Print JSON instead of one line per cache.
        #[arg(long)]
        json: bool,
    },
    /// Run passes on an interval until interrupted, then save the catalog.
    Watch {
        #[arg(long = "policy")]
        policies: Vec<u64>,
        /// Overrides `pass_interval_ms` from the config.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            policies,
            now,
            dry_run,
        } => run(&cli.catalog, config, &policies, now, dry_run).await,
        Command::Evaluate { policy, copy, now } => {
            evaluate_copy(&cli.catalog, PolicyId(policy), CopyId(copy), now).await
        }
        Command::Cycles { copy } => show_cycles(&cli.catalog, CopyId(copy)).await,
        Command::Usage { json } => show_usage(&cli.catalog, json).await,
        Command::Watch {
            policies,
            interval_secs,
        } => watch(&cli.catalog, config, &policies, interval_secs).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_json_file(path).map_err(|err| anyhow!(err)),
        None => Ok(EngineConfig::default()),
    }
}

/// Open the catalog and install every policy it defines.
async fn open_engine(
    catalog_path: &Path,
    config: EngineConfig,
) -> Result<(Arc<InMemoryCatalog>, AgingRunner)> {
    let catalog = InMemoryCatalog::open(catalog_path)
        .await
        .with_context(|| format!("Failed to open catalog '{}'", catalog_path.display()))?;
    let catalog = Arc::new(catalog);

    let store = Arc::new(PolicyStore::new());
    for policy in catalog.snapshot().await.policies {
        store.define(policy)?;
    }

    let runner = AgingRunner::with_backend(store, catalog.clone(), config);
    Ok((catalog, runner))
}

fn policy_ids(runner: &AgingRunner, requested: &[u64]) -> Result<Vec<PolicyId>> {
    if requested.is_empty() {
        Ok(runner.policies().policy_ids()?)
    } else {
        Ok(requested.iter().copied().map(PolicyId).collect())
    }
}

async fn run(
    catalog_path: &Path,
    config: EngineConfig,
    requested: &[u64],
    now: Option<DateTime<Utc>>,
    dry_run: bool,
) -> Result<()> {
    let (catalog, runner) = open_engine(catalog_path, config).await?;
    let policies = policy_ids(&runner, requested)?;
    let now = now.unwrap_or_else(Utc::now);

    let mut failed = 0;
    for (policy_id, result) in runner
        .run_policies(&policies, now, &CancelToken::new())
        .await
    {
        let report = result.with_context(|| format!("Aging pass for {} did not run", policy_id))?;
        if report.status == PassStatus::Failed {
            failed += 1;
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if dry_run {
        tracing::info!("dry run: catalog left unchanged");
    } else {
        catalog
            .save(catalog_path)
            .await
            .with_context(|| format!("Failed to save catalog '{}'", catalog_path.display()))?;
    }

    if failed > 0 {
        return Err(anyhow!("{} aging pass(es) reported failed copies", failed));
    }
    Ok(())
}

async fn evaluate_copy(
    catalog_path: &Path,
    policy_id: PolicyId,
    copy_id: CopyId,
    now: Option<DateTime<Utc>>,
) -> Result<()> {
    let state = InMemoryCatalog::open(catalog_path).await?.snapshot().await;
    let policy = state
        .policies
        .iter()
        .find(|policy| policy.policy_id == policy_id)
        .ok_or_else(|| anyhow!("Policy {} is not in the catalog", policy_id))?;
    let copy = policy.copy(copy_id)?;
    let record = state.copies.get(&copy_id).cloned().unwrap_or_default();

    let decision = evaluate(
        copy,
        &copy.retention,
        &record.jobs,
        &record.checkpoints,
        now.unwrap_or_else(Utc::now),
    )?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

async fn show_cycles(catalog_path: &Path, copy_id: CopyId) -> Result<()> {
    let state = InMemoryCatalog::open(catalog_path).await?.snapshot().await;
    let record = state.copies.get(&copy_id).cloned().unwrap_or_default();
    let cycles = assign_cycles(&record.jobs)?;

    for cycle in cycles.cycles() {
        let status = if cycles.is_open(cycle.cycle_id) { " (open)" } else { "" };
        let members: Vec<String> = cycle.jobs.iter().map(ToString::to_string).collect();
        println!(
            "{}{} opened {} by {}: {}",
            cycle.cycle_id,
            status,
            cycle.opened_at.to_rfc3339(),
            cycle.opened_by,
            members.join(", ")
        );
    }
    Ok(())
}

async fn show_usage(catalog_path: &Path, json: bool) -> Result<()> {
    let rows = InMemoryCatalog::open(catalog_path).await?.cache_usage().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for row in rows {
        let usage = row
            .usage_pct
            .map(|pct| format!("{:.1}%", pct))
            .unwrap_or_else(|| "no sample".to_string());
        println!(
            "{} {}: {} (high {}%, low {}%) {}",
            row.policy_id,
            row.copy_id,
            usage,
            row.high_watermark_pct,
            row.low_watermark_pct,
            row.evictor_state
        );
    }
    Ok(())
}

async fn watch(
    catalog_path: &Path,
    config: EngineConfig,
    requested: &[u64],
    interval_secs: Option<u64>,
) -> Result<()> {
    let interval = interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.pass_interval_duration());
    let (catalog, runner) = open_engine(catalog_path, config).await?;
    let policies = policy_ids(&runner, requested)?;

    let shutdown = CancelToken::new();
    let handle = spawn_schedule(Arc::new(runner), policies, interval, shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    shutdown.cancel();
    handle.await.context("Aging schedule panicked")?;

    catalog
        .save(catalog_path)
        .await
        .with_context(|| format!("Failed to save catalog '{}'", catalog_path.display()))?;
    Ok(())
}
