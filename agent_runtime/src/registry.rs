//! Name-keyed catalogue of agent types with run-time status and metadata.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::agent::{Agent, AgentConstructor, AgentContext, AgentMetadata};
use crate::error::{panic_message, RuntimeError};
use crate::shutdown::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Stopped,
    Running,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Lifecycle verb accepted by [`AgentRegistry::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    Start,
    Stop,
    Restart,
}

impl FromStr for AgentAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            other => Err(other.to_string()),
        }
    }
}

/// Snapshot row returned by [`AgentRegistry::list`]. Never exposes the
/// constructor or live instances.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSummary {
    pub status: AgentStatus,
    pub metadata: AgentMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct AgentEntry {
    constructor: AgentConstructor,
    metadata: AgentMetadata,
    status: AgentStatus,
    last_error: Option<String>,
    /// Bumped on every registry start so stale threads cannot overwrite status.
    generation: u64,
    run: Option<RegistryRun>,
}

struct RegistryRun {
    token: CancellationToken,
    _thread: thread::JoinHandle<()>,
}

type SharedEntries = Arc<Mutex<HashMap<String, AgentEntry>>>;

/// Process-wide agent catalogue, owned by the composition root and shared by
/// cloning (all clones see the same entries).
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: SharedEntries,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `name`. Status resets to `stopped`; a thread started
    /// for the previous registration is signalled to stop.
    pub fn register(&self, name: impl Into<String>, constructor: AgentConstructor, metadata: AgentMetadata) {
        let name = name.into();
        let mut agents = self.agents.lock();
        // Generations keep counting across overwrites so a superseded thread
        // never matches a later run.
        let generation = agents.get(&name).map_or(0, |old| old.generation);
        let entry = AgentEntry {
            constructor,
            metadata,
            status: AgentStatus::Stopped,
            last_error: None,
            generation,
            run: None,
        };

        let previous = agents.insert(name.clone(), entry);
        drop(agents);
        match previous {
            Some(old) => {
                warn!(agent = %name, "agent re-registered, previous registration replaced");
                if let Some(run) = old.run {
                    run.token.cancel();
                }
            }
            None => info!(agent = %name, "registering agent"),
        }
    }

    pub fn list(&self) -> BTreeMap<String, AgentSummary> {
        self.agents
            .lock()
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    AgentSummary {
                        status: entry.status,
                        metadata: entry.metadata.clone(),
                        last_error: entry.last_error.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.lock().contains_key(name)
    }

    pub fn status(&self, name: &str) -> Option<AgentStatus> {
        self.agents.lock().get(name).map(|entry| entry.status)
    }

    pub fn metadata(&self, name: &str) -> Option<AgentMetadata> {
        self.agents.lock().get(name).map(|entry| entry.metadata.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.lock().is_empty()
    }

    /// Apply a lifecycle verb and describe the outcome. Never fails: unknown
    /// names and actions come back as descriptive text.
    #[instrument(skip(self))]
    pub fn control(&self, name: &str, action: &str) -> String {
        let mut agents = self.agents.lock();
        let Some(entry) = agents.get_mut(name) else {
            return format!("Agent '{}' not found.", name);
        };

        let action = match action.parse::<AgentAction>() {
            Ok(action) => action,
            Err(unknown) => return format!("Unknown action '{}'.", unknown),
        };

        match action {
            AgentAction::Start => self.start_entry(name, entry),
            AgentAction::Stop => Self::stop_entry(name, entry),
            AgentAction::Restart => {
                Self::stop_entry(name, entry);
                self.start_entry(name, entry)
            }
        }
    }

    fn start_entry(&self, name: &str, entry: &mut AgentEntry) -> String {
        if entry.status == AgentStatus::Running {
            return format!("Agent '{}' already running.", name);
        }

        entry.generation += 1;
        let generation = entry.generation;
        let token = CancellationToken::new();
        let shared = Arc::clone(&self.agents);
        let constructor = Arc::clone(&entry.constructor);
        let metadata = entry.metadata.clone();
        let agent_name = name.to_string();
        let thread_token = token.clone();

        let spawned = thread::Builder::new()
            .name(format!("agent-{}", name))
            .spawn(move || {
                run_registered_agent(shared, agent_name, generation, constructor, metadata, thread_token)
            });

        match spawned {
            Ok(handle) => {
                entry.status = AgentStatus::Running;
                entry.last_error = None;
                entry.run = Some(RegistryRun {
                    token,
                    _thread: handle,
                });
                info!(agent = %name, generation, "agent started");
                format!("Agent '{}' started.", name)
            }
            Err(source) => {
                let err = RuntimeError::Spawn {
                    name: name.to_string(),
                    source,
                };
                error!(agent = %name, error = %err, "failed to start agent");
                entry.status = AgentStatus::Error;
                entry.last_error = Some(err.to_string());
                format!("Error during start of {}: {}", name, err)
            }
        }
    }

    // Cooperative only: the thread keeps running until it observes the token.
    fn stop_entry(name: &str, entry: &mut AgentEntry) -> String {
        entry.status = AgentStatus::Stopped;
        if let Some(run) = entry.run.take() {
            run.token.cancel();
        }
        info!(agent = %name, "agent marked as stopped");
        format!("Agent '{}' marked as stopped (stop signal sent).", name)
    }

    /// Build a fresh instance of `name` with `args`, outside the registry lock.
    pub fn instantiate(&self, name: &str, args: &Value) -> Result<(Box<dyn Agent>, AgentMetadata), RuntimeError> {
        let (constructor, metadata) = {
            let agents = self.agents.lock();
            let entry = agents
                .get(name)
                .ok_or_else(|| RuntimeError::agent_not_found(name))?;
            (Arc::clone(&entry.constructor), entry.metadata.clone())
        };

        let agent = constructor(args).map_err(|e| RuntimeError::AgentConstruction {
            name: name.to_string(),
            reason: format!("{:#}", e),
        })?;
        Ok((agent, metadata))
    }

    /// Record a status reported by an external driver such as the lifecycle manager.
    pub(crate) fn set_status(&self, name: &str, status: AgentStatus, last_error: Option<String>) {
        if let Some(entry) = self.agents.lock().get_mut(name) {
            entry.status = status;
            if last_error.is_some() || status == AgentStatus::Running {
                entry.last_error = last_error;
            }
        }
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}

/// Thread entry point for registry-started agents.
fn run_registered_agent(
    shared: SharedEntries,
    name: String,
    generation: u64,
    constructor: AgentConstructor,
    metadata: AgentMetadata,
    token: CancellationToken,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<()> {
        let agent = constructor(&Value::Null)?;
        info!(
            agent = %name,
            description = %metadata.description,
            model = %metadata.model_type,
            data_source = %metadata.data_source,
            "running agent"
        );
        let ctx = AgentContext::new(name.clone(), metadata.clone(), token);
        agent.run(&ctx)
    }));

    let fault = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{:#}", e)),
        Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
    };

    let mut agents = shared.lock();
    let Some(entry) = agents.get_mut(&name) else {
        return;
    };
    if entry.generation != generation {
        if let Some(fault) = fault {
            warn!(agent = %name, generation, error = %fault, "superseded agent run failed");
        }
        return;
    }

    match fault {
        Some(fault) => {
            error!(agent = %name, error = %fault, "agent execution failed");
            entry.status = AgentStatus::Error;
            entry.last_error = Some(fault);
        }
        None => {
            if entry.status == AgentStatus::Running {
                entry.status = AgentStatus::Stopped;
            }
            info!(agent = %name, "agent run finished");
        }
    }
    entry.run = None;
}
