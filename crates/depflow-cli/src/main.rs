use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use depflow_core::{
    init_tracing, CacheInvalidator, ChannelId, ConfigManager, DepflowConfig, EntityHandle,
    MaintenanceAction, ObjectId, ObjectType, PublishQueue, StaticRegistry,
};
use depflow_graph::{DependencyManager, SledDependencyStore};
use depflow_queue::{
    EventLog, QueueEntry, QueueFilter, QueueProcessor, QueueStore, QueueWorker, SledQueueStore,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "depflow")]
#[command(about = "Depflow CLI - dependency tracking and dirt propagation queue", long_about = None)]
#[command(version)]
struct Cli {
    /// Output format (json, pretty)
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    /// Data directory holding the queue and dependency stores
    #[arg(long, global = true, env = "DEPFLOW_STORE_PATH")]
    store: Option<PathBuf>,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue inspection and consumption
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queue entries, oldest first
    List {
        /// Only failed entries
        #[arg(long)]
        failed: bool,

        /// Only entries of this object type (name or type code)
        #[arg(short = 't', long = "type")]
        object_type: Option<String>,

        /// Maximum number of entries to list
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Pending and failed entry counts
    Stats,

    /// Delete failed entries
    DeleteFailed {
        /// Only entries of this object type (name or type code)
        #[arg(short = 't', long = "type")]
        object_type: Option<String>,
    },

    /// Process pending entries until the queue is empty or blocked
    Drain {
        /// Maximum number of entries to process
        #[arg(short, long)]
        limit: Option<usize>,

        /// JSON file with the entities known to the registry
        #[arg(short, long)]
        registry: Option<PathBuf>,
    },

    /// Run queue workers until interrupted (Ctrl-C)
    Work {
        /// Number of concurrent workers
        #[arg(short, long, default_value = "1")]
        workers: usize,

        /// JSON file with the entities known to the registry
        #[arg(short, long)]
        registry: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Target path
        path: PathBuf,
    },

    /// Show the effective configuration
    Show,
}

#[derive(Serialize)]
struct EntryView {
    id: Option<u64>,
    timestamp: String,
    object: String,
    event_mask: String,
    properties: String,
    simulation: String,
    session: Option<String>,
    failed: bool,
    fail_reason: Option<String>,
}

impl From<&QueueEntry> for EntryView {
    fn from(entry: &QueueEntry) -> Self {
        let object = match (entry.obj_type, entry.obj_id) {
            (Some(kind), Some(id)) => format!("{} {}", kind, id),
            (Some(kind), None) => kind.to_string(),
            _ => "-".to_string(),
        };
        Self {
            id: entry.id,
            timestamp: chrono::DateTime::from_timestamp(entry.timestamp, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| entry.timestamp.to_string()),
            object,
            event_mask: entry
                .event_mask
                .map_or_else(|| "-".to_string(), |m| m.to_string()),
            properties: entry.properties.join(","),
            simulation: format!("{:?}", entry.simulation),
            session: entry.sid.clone(),
            failed: entry.failed,
            fail_reason: entry.fail_reason.clone(),
        }
    }
}

#[derive(Serialize)]
struct StatsResult {
    pending: usize,
    failed: usize,
    by_type: BTreeMap<String, usize>,
}

/// Stands in for the platform's cache and publish queue when draining from
/// the command line: dirts are logged only.
struct LoggingPublisher;

impl CacheInvalidator for LoggingPublisher {
    fn invalidate(&self, kind: ObjectType, id: ObjectId) {
        info!(%kind, id, "Cache invalidated");
    }
}

impl PublishQueue for LoggingPublisher {
    fn dirt(
        &self,
        entity: &EntityHandle,
        channel: ChannelId,
        properties: &[String],
    ) -> depflow_core::Result<()> {
        info!(entity = %entity.entity_ref(), channel, ?properties, "Dirted");
        Ok(())
    }

    fn maintain(&self, action: &MaintenanceAction) -> depflow_core::Result<u64> {
        warn!(kind = ?action.kind, "No publish queue attached, maintenance skipped");
        Ok(0)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match execute_command(&cli).await {
        Ok(output) => {
            print_output(&cli.output, &output)?;
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

async fn execute_command(cli: &Cli) -> Result<serde_json::Value> {
    if let Commands::Config(ConfigCommands::Init { path }) = &cli.command {
        ConfigManager::create_default_config(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        return Ok(serde_json::json!({ "created": path.display().to_string() }));
    }

    let manager = match &cli.config {
        Some(path) => ConfigManager::load_from(path),
        None => ConfigManager::load(),
    }
    .context("Failed to load configuration")?;
    let config = manager.config().clone();
    init_tracing(&config.logging);

    match &cli.command {
        Commands::Config(ConfigCommands::Show) => Ok(serde_json::to_value(&config)?),
        Commands::Config(ConfigCommands::Init { .. }) => Ok(serde_json::Value::Null),
        Commands::Queue(cmd) => {
            let data_dir = cli.store.clone().unwrap_or_else(|| config.store.path.clone());
            execute_queue_command(cmd, &data_dir, &config).await
        }
    }
}

async fn execute_queue_command(
    cmd: &QueueCommands,
    data_dir: &Path,
    config: &DepflowConfig,
) -> Result<serde_json::Value> {
    let queue = SledQueueStore::open(&data_dir.join("queue"))
        .with_context(|| format!("Failed to open queue store in {}", data_dir.display()))?;

    match cmd {
        QueueCommands::List {
            failed,
            object_type,
            limit,
        } => {
            let mut filter = if *failed {
                QueueFilter::failed()
            } else {
                QueueFilter::all()
            }
            .limit(*limit);
            if let Some(kind) = object_type {
                filter = filter.of_type(parse_type(kind)?);
            }
            let entries = queue.list(&filter).context("Failed to list queue")?;
            let views: Vec<EntryView> = entries.iter().map(EntryView::from).collect();
            Ok(serde_json::to_value(views)?)
        }

        QueueCommands::Stats => {
            let mut by_type = BTreeMap::new();
            for entry in queue.list(&QueueFilter::all())? {
                let key = entry
                    .obj_type
                    .map_or_else(|| "-".to_string(), |t| t.to_string());
                *by_type.entry(key).or_insert(0) += 1;
            }
            let stats = StatsResult {
                pending: queue.count(&QueueFilter::pending())?,
                failed: queue.count(&QueueFilter::failed())?,
                by_type,
            };
            Ok(serde_json::to_value(stats)?)
        }

        QueueCommands::DeleteFailed { object_type } => {
            let mut filter = QueueFilter::failed();
            if let Some(kind) = object_type {
                filter = filter.of_type(parse_type(kind)?);
            }
            let deleted = queue.delete(&filter).context("Failed to delete entries")?;
            queue.flush()?;
            Ok(serde_json::json!({ "deleted": deleted }))
        }

        QueueCommands::Drain { limit, registry } => {
            let queue = Arc::new(queue);
            let processor = build_processor(queue.clone(), data_dir, registry.as_deref(), config)?;
            let summary = processor.drain(*limit).context("Failed to drain queue")?;
            queue.flush()?;
            Ok(serde_json::to_value(summary)?)
        }

        QueueCommands::Work { workers, registry } => {
            let queue = Arc::new(queue);
            let processor = Arc::new(build_processor(
                queue.clone(),
                data_dir,
                registry.as_deref(),
                config,
            )?);

            let mut handles = Vec::new();
            let mut tokens = Vec::new();
            for _ in 0..(*workers).max(1) {
                let worker = QueueWorker::new(processor.clone());
                info!(worker = %worker.id(), "Starting queue worker");
                tokens.push(worker.cancellation_token());
                handles.push(worker.spawn());
            }

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Interrupted, stopping workers");
            for token in &tokens {
                token.cancel();
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Queue worker ended abnormally");
                }
            }
            queue.flush()?;
            Ok(serde_json::json!({
                "workers": tokens.len(),
                "pending": queue.count(&QueueFilter::pending())?,
                "failed": queue.count(&QueueFilter::failed())?,
            }))
        }
    }
}

/// Wires the stores in `data_dir` into a processor whose dirts are logged.
fn build_processor(
    queue: Arc<SledQueueStore>,
    data_dir: &Path,
    registry: Option<&Path>,
    config: &DepflowConfig,
) -> Result<QueueProcessor> {
    let entities = Arc::new(StaticRegistry::new());
    if let Some(path) = registry {
        let loaded = load_registry(&entities, path)?;
        info!(entities = loaded, "Loaded registry");
    }
    let deps = SledDependencyStore::open(&data_dir.join("dependencies"))
        .context("Failed to open dependency store")?;
    let publisher = Arc::new(LoggingPublisher);
    let graph = Arc::new(DependencyManager::new(
        Arc::new(deps),
        entities,
        publisher.clone(),
        publisher.clone(),
        config,
    ));
    Ok(QueueProcessor::new(
        Arc::new(EventLog::new(queue)),
        graph,
        publisher,
        &config.queue,
    ))
}

fn parse_type(raw: &str) -> Result<ObjectType> {
    raw.parse::<ObjectType>()
        .with_context(|| format!("Unknown object type '{}'", raw))
}

fn load_registry(registry: &StaticRegistry, path: &Path) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let entities: Vec<EntityHandle> =
        serde_json::from_str(&raw).context("Registry file must be a JSON list of entities")?;
    let count = entities.len();
    for entity in entities {
        registry.insert(entity);
    }
    Ok(count)
}

fn print_output(format: &OutputFormat, value: &serde_json::Value) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Pretty => {
            print_pretty(value)?;
        }
    }
    Ok(())
}

fn print_pretty(value: &serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                let key_colored = key.cyan().bold();
                match val {
                    serde_json::Value::String(s) => {
                        println!("{}: {}", key_colored, s.green());
                    }
                    serde_json::Value::Number(n) => {
                        println!("{}: {}", key_colored, n.to_string().yellow());
                    }
                    serde_json::Value::Bool(b) => {
                        let val_colored = if *b { "true".red() } else { "false".green() };
                        println!("{}: {}", key_colored, val_colored);
                    }
                    serde_json::Value::Null => {
                        println!("{}: {}", key_colored, "-".dimmed());
                    }
                    _ => {
                        println!("{}: {}", key_colored, val);
                    }
                }
            }
        }
        serde_json::Value::Array(arr) if arr.is_empty() => {
            println!("{}", "(empty)".dimmed());
        }
        serde_json::Value::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                println!("\n{}{}:", "Entry ".cyan(), (i + 1).to_string().yellow());
                print_pretty(item)?;
            }
        }
        _ => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
    }
    Ok(())
}
