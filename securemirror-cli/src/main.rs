use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use securemirror_core::core_membership::UserQueueReconciler;
use securemirror_core::core_policy::{Principal, PrincipalContext, StaticClaim};
use securemirror_core::logging::init_logging_with_config;
use securemirror_core::metrics;
use securemirror_core::{Config, MemoryStore, RemoteStore, Session, StorePath};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mirrorctl")]
#[command(author, version, about = "Inspect permission-filtered mirrors over a store dump", long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file holding the type policies
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON file seeding the in-memory store
    #[arg(short, long)]
    data: PathBuf,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the records of a type visible to a principal
    Snapshot {
        type_name: String,
        /// Principal to log in as; anonymous when omitted
        #[arg(short, long)]
        principal: Option<String>,
    },
    /// Explain whether a principal may read one record
    Check {
        type_name: String,
        record_id: String,
        #[arg(short, long)]
        principal: Option<String>,
    },
    /// Apply a principal's pending membership queue for a type
    Drain {
        type_name: String,
        #[arg(short, long)]
        principal: String,
    },
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    config.validate()?;
    Ok(config)
}

fn load_store(path: &Path) -> Result<Arc<MemoryStore>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading store dump {}", path.display()))?;
    let data: Value = serde_json::from_str(&raw).context("store dump is not valid JSON")?;
    Ok(Arc::new(MemoryStore::with_data(data)))
}

async fn load_principal(store: &MemoryStore, id: &str) -> Result<Principal> {
    let profile = store.get(&StorePath::profile(id)).await?;
    if profile.is_none() {
        warn!(principal = %id, "no profile stored, using an empty one");
    }
    Ok(Principal::from_profile(id, profile.as_ref()))
}

async fn snapshot(
    store: Arc<MemoryStore>,
    config: &Config,
    type_name: &str,
    principal: Option<String>,
) -> Result<Value> {
    let mut session = Session::from_config(store, config)?;
    if let Some(id) = principal {
        session.login(Arc::new(StaticClaim::new(id))).await?;
    }

    let mirror = session.mirror(type_name).await?;
    mirror.loaded().await?;
    let snapshot = mirror.snapshot().await;
    if let Some(failure) = mirror.reconcile_failures().await {
        warn!(failed = ?failure.failed_targets(), "mirror opened with unapplied queue entries");
    }
    session.logout().await;
    Ok(snapshot.to_value())
}

async fn check(
    store: Arc<MemoryStore>,
    config: &Config,
    type_name: &str,
    record_id: &str,
    principal: Option<String>,
) -> Result<Value> {
    let policies = config.policy_set()?;
    let policy = policies
        .get(type_name)
        .ok_or_else(|| anyhow!("no policy configured for type '{}'", type_name))?;

    let principal = match principal {
        Some(id) => Some(load_principal(&store, &id).await?),
        None => None,
    };
    let value = store.get(&StorePath::record(type_name, record_id)).await?;
    let grant = config
        .evaluator()
        .evaluate(principal.as_ref(), policy, Some(record_id), value.as_ref());

    Ok(json!({
        "type": type_name,
        "id": record_id,
        "exists": value.is_some(),
        "grant": grant.map(|g| g.to_string()),
    }))
}

async fn drain(store: Arc<MemoryStore>, type_name: &str, principal: &str) -> Result<Value> {
    let context = PrincipalContext::new(load_principal(&store, principal).await?);
    let reconciler = UserQueueReconciler::new(store.clone(), context.clone(), type_name);
    let report = reconciler.drain().await?;

    let applied: Vec<Value> = report
        .applied
        .iter()
        .map(|entry| json!({ "id": entry.record_id, "desired": entry.desired }))
        .collect();
    Ok(json!({
        "principal": principal,
        "type": type_name,
        "applied": applied,
        "index": context.indexed_ids(type_name).await,
    }))
}

/// Install the log subscriber, then describe every metric
fn init_observability(config: &Config) -> Result<()> {
    init_logging_with_config(config.log_config()?)?;
    metrics::init_metrics();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_observability(&config)?;

    let store = load_store(&args.data)?;
    info!(policies = config.policies.len(), "mirrorctl started");

    let output = match args.command {
        Command::Snapshot {
            type_name,
            principal,
        } => snapshot(store, &config, &type_name, principal).await?,
        Command::Check {
            type_name,
            record_id,
            principal,
        } => check(store, &config, &type_name, &record_id, principal).await?,
        Command::Drain {
            type_name,
            principal,
        } => drain(store, &type_name, &principal).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observability_installs_once() {
        init_observability(&Config::default()).unwrap();
        // The global subscriber is taken; a second install reports it.
        assert!(init_observability(&Config::default()).is_err());
    }
}
