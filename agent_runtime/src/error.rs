//! Error taxonomy shared by the agent and feature subsystems.

use std::any::Any;
use thiserror::Error;

/// Errors surfaced at the registry, lifecycle and feature-store boundaries.
///
/// None of these escape as panics: callers receive them as values and the
/// components log them where they are produced.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Unknown agent name or missing feature artifact.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Informational: the agent already has a live thread.
    #[error("agent '{0}' already running")]
    AlreadyRunning(String),

    /// The artifact failed to compile or its top-level statements failed.
    #[error("failed to load feature '{name}': {reason}")]
    LoadFailure { name: String, reason: String },

    /// The loaded unit lacks `new_strategy` or returned the wrong shape.
    #[error("feature '{name}' violates the strategy contract: {reason}")]
    ContractViolation { name: String, reason: String },

    /// The strategy raised or panicked while being invoked.
    #[error("evaluation of feature '{name}' failed: {reason}")]
    EvaluationFailure { name: String, reason: String },

    /// Write, rename or delete on the artifact directory failed.
    #[error("persistence failure for '{name}': {source}")]
    PersistenceFailure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid feature name '{0}'")]
    InvalidFeatureName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to construct agent '{name}': {reason}")]
    AgentConstruction { name: String, reason: String },

    #[error("failed to spawn thread for agent '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    pub fn agent_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "agent",
            name: name.into(),
        }
    }

    pub fn feature_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "feature",
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
