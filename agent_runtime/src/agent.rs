//! Agent contract, run context and the built-in agent kinds.

use crate::shutdown::CancellationToken;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A pluggable unit of work with its own lifecycle, run on a dedicated thread.
///
/// `run` is expected to be long-lived. It must observe `ctx` at iteration
/// boundaries (`ctx.is_cancelled()` / `ctx.sleep(..)`) so a stop request can
/// be honoured; agents that never look at the context can only be abandoned.
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, ctx: &AgentContext) -> Result<()>;

    /// Optional cooperative stop hook, invoked from the controlling thread.
    fn stop(&self) {}

    /// Concrete type name, reported by the lifecycle manager.
    fn kind(&self) -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// Factory producing a fresh instance from keyword-style JSON arguments.
pub type AgentConstructor = Arc<dyn Fn(&Value) -> Result<Box<dyn Agent>> + Send + Sync>;

/// Wrap a closure as an [`AgentConstructor`].
pub fn constructor<F>(f: F) -> AgentConstructor
where
    F: Fn(&Value) -> Result<Box<dyn Agent>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Descriptive metadata attached to a registered agent type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub data_source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

fn default_model_type() -> String {
    "unknown".to_string()
}

impl AgentMetadata {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            model_type: default_model_type(),
            data_source: String::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_model_type(mut self, model_type: impl Into<String>) -> Self {
        self.model_type = model_type.into();
        self
    }

    pub fn with_data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = data_source.into();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Everything a running agent may consult: identity, metadata, stop signal.
#[derive(Debug, Clone)]
pub struct AgentContext {
    name: String,
    metadata: AgentMetadata,
    token: CancellationToken,
}

impl AgentContext {
    pub fn new(name: impl Into<String>, metadata: AgentMetadata, token: CancellationToken) -> Self {
        Self {
            name: name.into(),
            metadata,
            token,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &AgentMetadata {
        &self.metadata
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Park for `duration`; returns `true` if a stop was requested meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.token.wait_timeout(duration)
    }
}

pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    // Strip generic arguments first so `a::B<c::D>` reports `B`.
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn parse_args<T>(args: &Value) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if args.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(args.clone()).context("invalid agent arguments")
}

// --- Built-in Agents ---

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EchoArgs {
    message: String,
    interval_ms: u64,
}

impl Default for EchoArgs {
    fn default() -> Self {
        Self {
            message: "echo".to_string(),
            interval_ms: 1_000,
        }
    }
}

/// Simple echo agent: logs its message on every tick until stopped.
pub struct EchoAgent {
    name: String,
    message: String,
    interval: Duration,
    ticks: AtomicU64,
    stop_requested: AtomicBool,
}

impl EchoAgent {
    pub fn new(name: impl Into<String>, message: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            interval,
            ticks: AtomicU64::new(0),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn from_args(name: &str, args: &Value) -> Result<Self> {
        let args: EchoArgs = parse_args(args)?;
        if args.interval_ms == 0 {
            return Err(anyhow!("echo interval_ms must be positive"));
        }
        Ok(Self::new(name, args.message, Duration::from_millis(args.interval_ms)))
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Agent for EchoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &AgentContext) -> Result<()> {
        while !ctx.is_cancelled() && !self.stop_requested.load(Ordering::Acquire) {
            let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(agent = %self.name, tick, message = %self.message, "echo");
            if ctx.sleep(self.interval) {
                break;
            }
        }
        info!(agent = %self.name, ticks = self.ticks(), "echo agent exiting");
        Ok(())
    }

    fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ConfiguredArgs {
    heartbeat_secs: u64,
}

impl Default for ConfiguredArgs {
    fn default() -> Self {
        Self { heartbeat_secs: 30 }
    }
}

/// Stub agent declared in a catalogue file: announces its metadata, then
/// emits a heartbeat until cancelled.
pub struct ConfiguredAgent {
    name: String,
    metadata: AgentMetadata,
    heartbeat: Duration,
}

impl ConfiguredAgent {
    pub fn new(name: impl Into<String>, metadata: AgentMetadata, heartbeat: Duration) -> Self {
        Self {
            name: name.into(),
            metadata,
            heartbeat,
        }
    }

    pub fn from_args(name: &str, metadata: AgentMetadata, args: &Value) -> Result<Self> {
        let args: ConfiguredArgs = parse_args(args)?;
        let heartbeat = Duration::from_secs(args.heartbeat_secs.max(1));
        Ok(Self::new(name, metadata, heartbeat))
    }
}

impl Agent for ConfiguredAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &AgentContext) -> Result<()> {
        info!(
            agent = %self.name,
            description = %self.metadata.description,
            model = %self.metadata.model_type,
            data_source = %self.metadata.data_source,
            "configured agent running"
        );
        while !ctx.sleep(self.heartbeat) {
            debug!(agent = %self.name, "heartbeat");
        }
        Ok(())
    }
}

/// Named constructors for the agent kinds shipped with the runtime.
pub struct BuiltinAgents;

impl BuiltinAgents {
    pub const KINDS: &'static [&'static str] = &["echo", "configured"];

    /// Constructor for `kind`, bound to the registered `name`.
    pub fn constructor(kind: &str, name: &str, metadata: &AgentMetadata) -> Option<AgentConstructor> {
        let name = name.to_string();
        match kind {
            "echo" => Some(constructor(move |args| {
                Ok(Box::new(EchoAgent::from_args(&name, args)?) as Box<dyn Agent>)
            })),
            "configured" => {
                let metadata = metadata.clone();
                // Catalogue entries carry their heartbeat in metadata.
                let declared = metadata
                    .extra
                    .get("heartbeat_secs")
                    .and_then(|secs| secs.parse::<u64>().ok())
                    .map(|secs| serde_json::json!({ "heartbeat_secs": secs }));
                Some(constructor(move |args| {
                    let args = match (&declared, args) {
                        (Some(declared), Value::Null) => declared,
                        _ => args,
                    };
                    Ok(Box::new(ConfiguredAgent::from_args(&name, metadata.clone(), args)?)
                        as Box<dyn Agent>)
                }))
            }
            _ => None,
        }
    }

    pub fn create_agent(kind: &str, name: &str, args: &Value) -> Result<Box<dyn Agent>> {
        let ctor = Self::constructor(kind, name, &AgentMetadata::default())
            .ok_or_else(|| anyhow!("Unknown agent type: {}", kind))?;
        ctor(args)
    }
}
