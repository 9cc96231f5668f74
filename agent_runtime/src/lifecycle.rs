//! Agent lifecycle management on dedicated OS threads

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentContext};
use crate::error::{panic_message, RuntimeError};
use crate::registry::{AgentRegistry, AgentStatus};
use crate::shutdown::CancellationToken;

/// Which constructor arguments `restart_agent` hands to the new instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartArgs {
    /// Whatever the caller passes to `restart_agent` (absent means no arguments).
    #[default]
    Supplied,
    /// The arguments of the instance being replaced, unless the caller supplies new ones.
    Original,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub join_timeout: Duration,
    pub restart_args: RestartArgs,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(5),
            restart_args: RestartArgs::Supplied,
        }
    }
}

/// Per-instance row returned by [`AgentLifecycleManager::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub alive: bool,
    pub kind: String,
    pub instance_id: Uuid,
    pub started_at: DateTime<Utc>,
}

struct AgentHandle {
    instance: Arc<dyn Agent>,
    token: CancellationToken,
    /// Disconnects when the thread body returns.
    done_rx: Receiver<()>,
    thread: thread::JoinHandle<()>,
    args: Value,
    instance_id: Uuid,
    started_at: DateTime<Utc>,
}

impl AgentHandle {
    fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }
}

/// Tracks live instance/thread pairs started with explicit constructor
/// arguments. Cloning shares the same handle table.
pub struct AgentLifecycleManager {
    registry: AgentRegistry,
    handles: Arc<DashMap<String, AgentHandle>>,
    /// Held across check, spawn and insert so one id never has two live threads.
    slots: Arc<DashMap<String, Arc<Mutex<()>>>>,
    leaked: Arc<AtomicUsize>,
    config: LifecycleConfig,
}

impl AgentLifecycleManager {
    pub fn new(registry: AgentRegistry, config: LifecycleConfig) -> Result<Self, RuntimeError> {
        if config.join_timeout.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "lifecycle join timeout must be positive".to_string(),
            ));
        }
        Ok(Self {
            registry,
            handles: Arc::new(DashMap::new()),
            slots: Arc::new(DashMap::new()),
            leaked: Arc::new(AtomicUsize::new(0)),
            config,
        })
    }

    fn slot(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.slots.entry(id.to_string()).or_default().value())
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Construct `id` from the registry with `args` and run it on a new thread.
    #[instrument(skip(self, args))]
    pub fn start_agent(&self, id: &str, args: Value) -> Result<String, RuntimeError> {
        let slot = self.slot(id);
        let _slot = slot.lock();

        if let Some(existing) = self.handles.get(id) {
            if existing.is_alive() {
                return Err(RuntimeError::AlreadyRunning(id.to_string()));
            }
        }
        // Finished handle from an earlier run: reap it.
        if let Some((_, finished)) = self.handles.remove(id) {
            let _ = finished.thread.join();
            debug!(agent = %id, instance = %finished.instance_id, "reaped finished instance");
        }

        let (agent, metadata) = self.registry.instantiate(id, &args)?;
        let instance: Arc<dyn Agent> = Arc::from(agent);
        let token = CancellationToken::new();
        let instance_id = Uuid::new_v4();
        let (done_tx, done_rx) = channel::bounded::<()>(1);

        let ctx = AgentContext::new(id, metadata, token.clone());
        let runner = Arc::clone(&instance);
        let registry = self.registry.clone();
        let agent_id = id.to_string();
        let thread_token = token.clone();

        // Marked before spawning so a fast failure is not overwritten.
        self.registry.set_status(id, AgentStatus::Running, None);
        let spawned = thread::Builder::new()
            .name(format!("agent-{}", id))
            .spawn(move || {
                let _done = done_tx;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.run(&ctx)));
                let fault = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("{:#}", e)),
                    Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
                };

                // A cancelled token means stop_agent owns the status transition.
                if thread_token.is_cancelled() {
                    if let Some(fault) = fault {
                        warn!(agent = %agent_id, instance = %instance_id, error = %fault, "agent failed while stopping");
                    }
                    return;
                }
                match fault {
                    Some(fault) => {
                        error!(agent = %agent_id, instance = %instance_id, error = %fault, "agent execution failed");
                        registry.set_status(&agent_id, AgentStatus::Error, Some(fault));
                    }
                    None => {
                        info!(agent = %agent_id, instance = %instance_id, "agent run returned");
                        registry.set_status(&agent_id, AgentStatus::Stopped, None);
                    }
                }
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(source) => {
                let err = RuntimeError::Spawn {
                    name: id.to_string(),
                    source,
                };
                self.registry.set_status(id, AgentStatus::Error, Some(err.to_string()));
                return Err(err);
            }
        };

        let kind = instance.kind();
        self.handles.insert(
            id.to_string(),
            AgentHandle {
                instance,
                token,
                done_rx,
                thread,
                args,
                instance_id,
                started_at: Utc::now(),
            },
        );

        info!(agent = %id, instance = %instance_id, kind, "agent started");
        Ok(format!("Agent '{}' started.", id))
    }

    /// Signal `id` to stop and wait up to the join timeout. An agent that does
    /// not exit in time is abandoned and counted as leaked.
    #[instrument(skip(self))]
    pub fn stop_agent(&self, id: &str) -> String {
        let slot = self.slot(id);
        let _slot = slot.lock();

        let Some((_, handle)) = self.handles.remove(id) else {
            return format!("Agent '{}' not found.", id);
        };

        handle.instance.stop();
        handle.token.cancel();

        let message = match handle.done_rx.recv_timeout(self.config.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.thread.join().is_err() {
                    warn!(agent = %id, "agent thread terminated abnormally");
                }
                info!(agent = %id, instance = %handle.instance_id, "agent stopped");
                format!("Agent '{}' stopped.", id)
            }
            Err(RecvTimeoutError::Timeout) => {
                let leaked = self.leaked.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    agent = %id,
                    instance = %handle.instance_id,
                    timeout = ?self.config.join_timeout,
                    leaked,
                    "agent did not stop in time, abandoning thread"
                );
                format!(
                    "Agent '{}' did not stop within {:?}; thread abandoned.",
                    id, self.config.join_timeout
                )
            }
        };

        self.registry.set_status(id, AgentStatus::Stopped, None);
        message
    }

    /// `stop_agent` followed by `start_agent`. The arguments used for the new
    /// instance depend on [`RestartArgs`].
    pub fn restart_agent(&self, id: &str, args: Option<Value>) -> Result<String, RuntimeError> {
        let previous = self.handles.get(id).map(|h| h.args.clone());
        let stopped = self.stop_agent(id);
        debug!(agent = %id, outcome = %stopped, "restart: stop phase");

        let args = match self.config.restart_args {
            RestartArgs::Supplied => args,
            RestartArgs::Original => previous.or(args),
        }
        .unwrap_or(Value::Null);

        self.start_agent(id, args)
    }

    pub fn get_status(&self) -> BTreeMap<String, InstanceStatus> {
        self.handles
            .iter()
            .map(|entry| {
                let handle = entry.value();
                (
                    entry.key().clone(),
                    InstanceStatus {
                        alive: handle.is_alive(),
                        kind: handle.instance.kind().to_string(),
                        instance_id: handle.instance_id,
                        started_at: handle.started_at,
                    },
                )
            })
            .collect()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.handles.get(id).map(|h| h.is_alive()).unwrap_or(false)
    }

    /// Stop every tracked instance. Returns the number of ids processed.
    pub fn shutdown_all(&self) -> usize {
        let ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            let outcome = self.stop_agent(id);
            debug!(agent = %id, outcome = %outcome, "shutdown");
        }
        ids.len()
    }

    /// Threads abandoned after exceeding the join timeout.
    pub fn leaked_threads(&self) -> usize {
        self.leaked.load(Ordering::SeqCst)
    }
}

impl Clone for AgentLifecycleManager {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            handles: self.handles.clone(),
            slots: self.slots.clone(),
            leaked: self.leaked.clone(),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{constructor, AgentMetadata, BuiltinAgents, EchoAgent};
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Barrier;
    use std::time::Instant;

    fn manager_with(config: LifecycleConfig) -> AgentLifecycleManager {
        let registry = AgentRegistry::new();
        let metadata = AgentMetadata::new("echo");
        let echo = BuiltinAgents::constructor("echo", "echo", &metadata).unwrap();
        registry.register("echo", echo, metadata);
        AgentLifecycleManager::new(registry, config).unwrap()
    }

    fn manager() -> AgentLifecycleManager {
        manager_with(LifecycleConfig::default())
    }

    /// Ignores both the token and the stop hook until `release` is set.
    struct StubbornAgent {
        release: Arc<AtomicBool>,
    }

    impl Agent for StubbornAgent {
        fn name(&self) -> &str {
            "stubborn"
        }

        fn run(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
            while !self.release.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    /// Counts live run bodies; exits promptly on cancellation.
    struct CountingAgent {
        live: Arc<AtomicUsize>,
    }

    impl Agent for CountingAgent {
        fn name(&self) -> &str {
            "counting"
        }

        fn run(&self, ctx: &AgentContext) -> anyhow::Result<()> {
            self.live.fetch_add(1, Ordering::SeqCst);
            while !ctx.sleep(Duration::from_millis(5)) {}
            self.live.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_zero_join_timeout_rejected() {
        let config = LifecycleConfig {
            join_timeout: Duration::ZERO,
            ..Default::default()
        };
        let result = AgentLifecycleManager::new(AgentRegistry::new(), config);
        assert!(matches!(result, Err(RuntimeError::InvalidConfig(_))));
    }

    #[test]
    fn test_start_and_stop() {
        let manager = manager();
        let msg = manager.start_agent("echo", json!({"interval_ms": 5})).unwrap();
        assert!(msg.contains("started"));
        assert!(manager.is_running("echo"));
        assert_eq!(manager.registry().status("echo"), Some(AgentStatus::Running));

        let status = manager.get_status();
        assert!(status["echo"].alive);
        assert_eq!(status["echo"].kind, "EchoAgent");

        let msg = manager.stop_agent("echo");
        assert_eq!(msg, "Agent 'echo' stopped.");
        assert!(manager.get_status().is_empty());
        assert_eq!(manager.registry().status("echo"), Some(AgentStatus::Stopped));
        assert_eq!(manager.leaked_threads(), 0);
    }

    #[test]
    fn test_start_unregistered() {
        let manager = manager();
        let err = manager.start_agent("ghost", Value::Null).unwrap_err();
        assert!(err.is_not_found());
        assert!(manager.get_status().is_empty());
    }

    #[test]
    fn test_stop_unknown() {
        let manager = manager();
        assert_eq!(manager.stop_agent("ghost"), "Agent 'ghost' not found.");
    }

    #[test]
    fn test_bad_args_are_construction_errors() {
        let manager = manager();
        let err = manager.start_agent("echo", json!({"interval_ms": 0})).unwrap_err();
        assert!(matches!(err, RuntimeError::AgentConstruction { .. }));
    }

    #[test]
    fn test_start_twice_keeps_single_instance() {
        let manager = manager();
        manager.start_agent("echo", json!({"interval_ms": 5})).unwrap();
        let first = manager.get_status()["echo"].instance_id;

        let err = manager.start_agent("echo", Value::Null).unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyRunning(ref id) if id == "echo"));
        assert_eq!(manager.get_status().len(), 1);
        assert_eq!(manager.get_status()["echo"].instance_id, first);

        manager.shutdown_all();
    }

    #[test]
    fn test_concurrent_starts_track_single_thread() {
        let live = Arc::new(AtomicUsize::new(0));
        let registry = AgentRegistry::new();
        let counter = live.clone();
        registry.register(
            "slow",
            constructor(move |_| {
                thread::sleep(Duration::from_millis(50));
                Ok(Box::new(CountingAgent { live: counter.clone() }) as Box<dyn Agent>)
            }),
            AgentMetadata::default(),
        );
        let manager = AgentLifecycleManager::new(registry, LifecycleConfig::default()).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let racers: Vec<_> = (0..2)
            .map(|_| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    manager.start_agent("slow", Value::Null)
                })
            })
            .collect();
        let results: Vec<_> = racers.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(RuntimeError::AlreadyRunning(id)) if id == "slow")));
        assert_eq!(manager.get_status().len(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while live.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(live.load(Ordering::SeqCst), 1);

        assert_eq!(manager.stop_agent("slow"), "Agent 'slow' stopped.");
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restart_uses_supplied_args() {
        let manager = manager();
        manager.start_agent("echo", json!({"interval_ms": 5})).unwrap();
        let first = manager.get_status()["echo"].instance_id;

        manager.restart_agent("echo", Some(json!({"interval_ms": 7}))).unwrap();
        let status = manager.get_status();
        assert_ne!(status["echo"].instance_id, first);
        assert!(status["echo"].alive);
        assert_eq!(manager.handles.get("echo").unwrap().args, json!({"interval_ms": 7}));

        manager.restart_agent("echo", None).unwrap();
        assert_eq!(manager.handles.get("echo").unwrap().args, Value::Null);
        manager.shutdown_all();
    }

    #[test]
    fn test_restart_reuses_original_args() {
        let manager = manager_with(LifecycleConfig {
            restart_args: RestartArgs::Original,
            ..Default::default()
        });
        manager.start_agent("echo", json!({"interval_ms": 5})).unwrap();
        manager.restart_agent("echo", Some(json!({"interval_ms": 9}))).unwrap();
        assert_eq!(manager.handles.get("echo").unwrap().args, json!({"interval_ms": 5}));
        manager.shutdown_all();
    }

    #[test]
    fn test_restart_not_running_starts_fresh() {
        let manager = manager();
        manager.restart_agent("echo", Some(json!({"interval_ms": 5}))).unwrap();
        assert!(manager.is_running("echo"));
        manager.shutdown_all();
    }

    #[test]
    fn test_uncooperative_agent_is_abandoned() {
        let release = Arc::new(AtomicBool::new(false));
        let registry = AgentRegistry::new();
        let flag = release.clone();
        registry.register(
            "stubborn",
            constructor(move |_| Ok(Box::new(StubbornAgent { release: flag.clone() }) as Box<dyn Agent>)),
            AgentMetadata::default(),
        );
        let manager = AgentLifecycleManager::new(
            registry,
            LifecycleConfig {
                join_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .unwrap();

        manager.start_agent("stubborn", Value::Null).unwrap();
        let started = Instant::now();
        let msg = manager.stop_agent("stubborn");
        assert!(msg.contains("abandoned"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(manager.leaked_threads(), 1);
        assert!(manager.get_status().is_empty());

        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_failing_agent_mirrors_error() {
        let registry = AgentRegistry::new();
        registry.register(
            "flaky",
            constructor(|_| {
                struct Flaky;
                impl Agent for Flaky {
                    fn name(&self) -> &str {
                        "flaky"
                    }
                    fn run(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
                        Err(anyhow!("feed closed"))
                    }
                }
                Ok(Box::new(Flaky) as Box<dyn Agent>)
            }),
            AgentMetadata::default(),
        );
        let manager = AgentLifecycleManager::new(registry, LifecycleConfig::default()).unwrap();
        manager.start_agent("flaky", Value::Null).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while (manager.registry().status("flaky") != Some(AgentStatus::Error) || manager.is_running("flaky"))
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(manager.registry().status("flaky"), Some(AgentStatus::Error));
        assert!(!manager.is_running("flaky"));

        // The finished handle is reaped by the next start.
        manager.start_agent("flaky", Value::Null).unwrap();
        assert_eq!(manager.get_status().len(), 1);
    }

    #[test]
    fn test_clones_share_handles() {
        let manager = manager();
        let other = manager.clone();
        manager
            .start_agent("echo", json!({"interval_ms": 5}))
            .unwrap();
        assert!(other.is_running("echo"));
        assert_eq!(other.shutdown_all(), 1);
        assert!(!manager.is_running("echo"));
    }

    #[test]
    fn test_direct_instance_kind() {
        let agent: Arc<dyn Agent> = Arc::new(EchoAgent::new("e", "m", Duration::from_millis(5)));
        assert_eq!(agent.kind(), "EchoAgent");
    }
}
