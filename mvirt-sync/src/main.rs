//! mvirt-sync: diagnostic runner for the reconciliation engine.
//!
//! Reads local and remote state from JSON files, runs the comparison or a
//! full pass against in-memory backends, and prints the outcome as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_sync::provider::SnapshotFetcher;
use mvirt_sync::secrules::{Provider, Rule, RuleSet, compare_rules};
use mvirt_sync::{
    AuditLogger, KeyStrategy, LocalResource, MemoryAuditSink, MemoryStore, RemoteResource,
    ResourceKind, RouteTable, Scope, SyncConfig, SyncContext, Syncer,
};

/// mvirt cloud sync
#[derive(Parser, Debug)]
#[command(name = "mvirt-sync", version, about)]
struct Cli {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the join key strategy
    #[arg(long, value_enum)]
    key_strategy: Option<KeyArg>,

    /// Override the scope lock timeout in seconds
    #[arg(long)]
    lock_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compare a desired rule set with provider rules
    Rules {
        /// JSON file with provider, local and remote rules
        file: PathBuf,
    },

    /// Run one route table pass over in-memory state
    RouteTables {
        /// JSON file with scope, local and remote route tables
        file: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KeyArg {
    ExternalId,
    Signature,
}

impl From<KeyArg> for KeyStrategy {
    fn from(arg: KeyArg) -> Self {
        match arg {
            KeyArg::ExternalId => KeyStrategy::ExternalId,
            KeyArg::Signature => KeyStrategy::Signature,
        }
    }
}

/// A rule in text form (`in:allow tcp 22`) or as a full object.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum RuleInput {
    Text {
        rule: String,
        #[serde(default)]
        priority: i32,
        #[serde(default)]
        external_id: Option<String>,
    },
    Full(Rule),
}

impl RuleInput {
    fn into_rule(self) -> Result<Rule> {
        match self {
            RuleInput::Text {
                rule,
                priority,
                external_id,
            } => {
                let mut parsed: Rule = rule
                    .parse()
                    .with_context(|| format!("Invalid rule {:?}", rule))?;
                parsed.priority = priority;
                parsed.external_id = external_id;
                Ok(parsed)
            }
            RuleInput::Full(rule) => Ok(rule),
        }
    }
}

#[derive(Deserialize, Debug)]
struct RulesInput {
    provider: String,
    #[serde(default)]
    local: Vec<RuleInput>,
    #[serde(default)]
    remote: Vec<RuleInput>,
    #[serde(default = "enabled")]
    include_in: bool,
    #[serde(default = "enabled")]
    include_out: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Deserialize, Debug)]
struct RouteTablesInput {
    scope: Scope,
    #[serde(default)]
    local: Vec<LocalResource<RouteTable>>,
    #[serde(default)]
    remote: Vec<RemoteResource<RouteTable>>,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn to_rule_set(inputs: Vec<RuleInput>) -> Result<RuleSet> {
    inputs.into_iter().map(RuleInput::into_rule).collect()
}

fn run_rules(file: &Path) -> Result<()> {
    let input: RulesInput = read_json(file)?;
    let provider: Provider = input.provider.parse().map_err(|e: String| anyhow!(e))?;
    let local = to_rule_set(input.local)?;
    let remote = to_rule_set(input.remote)?;

    let diff = compare_rules(
        &provider.capabilities(),
        &local,
        &remote,
        input.include_in,
        input.include_out,
    )
    .with_context(|| format!("Failed to compare rules for {}", provider))?;

    info!(
        provider = %provider,
        adds = diff.add_count(),
        dels = diff.del_count(),
        "Compared rules"
    );
    println!("{}", serde_json::to_string_pretty(&diff)?);
    Ok(())
}

async fn run_route_tables(config: SyncConfig, file: &Path) -> Result<()> {
    let input: RouteTablesInput = read_json(file)?;
    let scope = input.scope;
    let local = input
        .local
        .into_iter()
        .map(|mut r| {
            r.fields
                .validate()
                .map_err(|e| anyhow!(e))
                .with_context(|| format!("Invalid local route table {}", r.name))?;
            if r.scope_id.is_empty() {
                r.scope_id = scope.lock_key();
            }
            Ok(r)
        })
        .collect::<Result<Vec<_>>>()?;

    let store = MemoryStore::with_resources(local);
    let fetcher = SnapshotFetcher::new(input.remote);
    let sink = Arc::new(MemoryAuditSink::new());
    let audit = Arc::new(AuditLogger::new(sink.clone(), config.audit_queue_capacity));
    let syncer = Syncer::new(config, audit.clone());

    let report = syncer
        .sync(&SyncContext::new("mvirt-sync"), &scope, &store, &fetcher)
        .await
        .with_context(|| format!("Route table sync of {} failed", scope))?;
    audit.flush().await;

    let output = json!({
        "result": report.result,
        "synced": report.synced,
        "audit": sink.events().await,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr, results to stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_sync=info,audit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(strategy) = cli.key_strategy {
        config.key_strategy = strategy.into();
    }
    if let Some(timeout) = cli.lock_timeout {
        config.lock_timeout_secs = timeout;
    }
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Rules { file } => run_rules(&file),
        Commands::RouteTables { file } => run_route_tables(config, &file).await,
    }
}
