//! Command-line interface definitions using clap derive API.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

use crate::{
    agent::{AgentMetadata, BuiltinAgents},
    catalog::AgentCatalog,
    features::{FeatureStore, FeatureUnit, FeatureWatcher},
    lifecycle::AgentLifecycleManager,
    registry::AgentRegistry,
    settings::Settings,
    shutdown::CancellationToken,
};

/// Agent runtime CLI
#[derive(Parser)]
#[command(name = "agent-runtime-cli")]
#[command(about = "Run agents and manage self-improving strategy features")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to ./agent_runtime.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the agent registry
    Agents {
        /// Agent catalogue (TOML or JSON)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Start every registered agent, report status, then stop them
    RunAgents {
        #[arg(long)]
        catalog: Option<PathBuf>,
        /// Seconds to let the agents run
        #[arg(long, default_value_t = 5)]
        duration: u64,
    },
    /// Store a feature artifact from a script file
    Write { name: String, file: PathBuf },
    /// Load a feature and report its entry point
    Load { name: String },
    /// List stored features and their versions
    Features,
    /// Evaluate a feature against a JSON dataset
    Evaluate {
        name: String,
        #[arg(long)]
        data: PathBuf,
    },
    /// Evaluate a feature and write an improved version if needed
    Improve {
        name: String,
        #[arg(long)]
        data: PathBuf,
    },
    /// Run the continuous evaluation cycle
    Cycle {
        #[arg(long)]
        data: PathBuf,
        /// Seconds between passes (defaults to evaluation.interval_secs)
        #[arg(long)]
        interval: Option<u64>,
        /// Stop after this many seconds (runs until killed otherwise)
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Report feature files changing on disk
    Watch {
        #[arg(long)]
        duration: Option<u64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Read an evaluation dataset: a JSON array of records.
pub fn load_dataset(path: &Path) -> Result<Vec<Value>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset: {:?}", path))?;
    match serde_json::from_str(&contents).with_context(|| format!("Failed to parse dataset: {:?}", path))? {
        Value::Array(records) => Ok(records),
        _ => Err(anyhow!("Dataset {:?} must be a JSON array of records", path)),
    }
}

/// Registry with the built-in echo agent plus every catalogue entry.
pub fn build_registry(catalog: Option<&Path>) -> Result<AgentRegistry> {
    let registry = AgentRegistry::new();
    let metadata = AgentMetadata::new("Logs a message on every tick").with_model_type("builtin");
    if let Some(echo) = BuiltinAgents::constructor("echo", "echo", &metadata) {
        registry.register("echo", echo, metadata);
    }

    if let Some(path) = catalog {
        let registered = AgentCatalog::load(path)?.register_all(&registry);
        info!(count = registered.len(), "catalog agents registered");
    }
    Ok(registry)
}

fn cancel_after(token: &CancellationToken, seconds: Option<u64>) {
    if let Some(seconds) = seconds {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(seconds));
            token.cancel();
        });
    }
}

/// Execute a parsed command.
pub fn run(command: Commands, settings: &Settings) -> Result<()> {
    let catalog_or_default =
        |catalog: Option<PathBuf>| catalog.or_else(|| settings.agents.catalog.clone());

    match command {
        Commands::Agents { catalog } => {
            let registry = build_registry(catalog_or_default(catalog).as_deref())?;
            print_json(&registry.list())
        }
        Commands::RunAgents { catalog, duration } => {
            let registry = build_registry(catalog_or_default(catalog).as_deref())?;
            let manager = AgentLifecycleManager::new(registry.clone(), settings.lifecycle_config())?;
            for name in registry.names() {
                match manager.start_agent(&name, Value::Null) {
                    Ok(message) => println!("{}", message),
                    Err(e) => println!("{}: {}", name, e),
                }
            }
            thread::sleep(Duration::from_secs(duration));
            print_json(&manager.get_status())?;
            manager.shutdown_all();
            if manager.leaked_threads() > 0 {
                println!("{} agent thread(s) abandoned", manager.leaked_threads());
            }
            print_json(&registry.list())
        }
        Commands::Write { name, file } => {
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read script: {:?}", file))?;
            let store = FeatureStore::new(settings.feature_store_config())?;
            let artifact = store.write(&name, &code)?;
            print_json(&artifact)
        }
        Commands::Load { name } => {
            let store = FeatureStore::new(settings.feature_store_config())?;
            let unit = store.load(&name)?;
            print_json(&serde_json::json!({
                "name": unit.name(),
                "hash": unit.hash(),
                "entry_point": unit.has_entry_point(),
            }))
        }
        Commands::Features => {
            let store = FeatureStore::new(settings.feature_store_config())?;
            let listing: Vec<Value> = store
                .feature_names()
                .into_iter()
                .map(|base| {
                    let versions = store.versions(&base);
                    serde_json::json!({ "feature": base, "versions": versions })
                })
                .collect();
            print_json(&listing)
        }
        Commands::Evaluate { name, data } => {
            let data = load_dataset(&data)?;
            let store = FeatureStore::new(settings.feature_store_config())?;
            let record = store.evaluate(&name, &data)?;
            print_json(&record)
        }
        Commands::Improve { name, data } => {
            let data = load_dataset(&data)?;
            let store = FeatureStore::new(settings.feature_store_config())?;
            match store.self_improve(&name, &data) {
                Some(version) => println!("wrote {}", version),
                None => println!("no improvement written for {}", name),
            }
            Ok(())
        }
        Commands::Cycle { data, interval, duration } => {
            let data = load_dataset(&data)?;
            let store = FeatureStore::new(settings.feature_store_config())?;
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.evaluation.interval());
            let token = CancellationToken::new();
            cancel_after(&token, duration);
            let passes = store.continuous_evaluation_cycle(&data, interval, &token)?;
            println!("completed {} pass(es)", passes);
            Ok(())
        }
        Commands::Watch { duration } => {
            let store = FeatureStore::new(settings.feature_store_config())?;
            let watcher = FeatureWatcher::start(Arc::clone(store.version_store()))?;
            let deadline = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
            println!("watching {:?}", store.version_store().dir());
            while deadline.map_or(true, |d| Instant::now() < d) {
                if let Some(event) = watcher.recv_timeout(Duration::from_millis(500)) {
                    store.invalidate(event.name());
                    println!("{:?}", event);
                }
            }
            Ok(())
        }
    }
}
