//! Agent catalogue files.
//!
//! A catalogue declares the agents a deployment should know about, either as
//! TOML (`[[agents]]` tables) or JSON (an `agents` array, or a bare array).
//! Each entry becomes a registry registration with its metadata attached.

use crate::{
    agent::{AgentMetadata, BuiltinAgents},
    registry::AgentRegistry,
};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

/// Default kind for entries that do not name one.
pub const DEFAULT_KIND: &str = "configured";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_model_type")]
    pub model_type: String,

    #[serde(default)]
    pub data_source: String,

    /// Built-in agent kind; defaults to the configured stub agent.
    #[serde(default)]
    pub kind: Option<String>,

    #[serde(default)]
    pub heartbeat_secs: Option<u64>,

    /// Free-form extra metadata.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

fn default_model_type() -> String {
    "unknown".to_string()
}

impl CatalogEntry {
    pub fn metadata(&self) -> AgentMetadata {
        let mut metadata = AgentMetadata::new(self.description.clone())
            .with_model_type(self.model_type.clone())
            .with_data_source(self.data_source.clone());
        metadata.extra = self.extra.clone();
        if let Some(secs) = self.heartbeat_secs {
            metadata = metadata.with_extra("heartbeat_secs", secs.to_string());
        }
        metadata
    }

    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(DEFAULT_KIND)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCatalog {
    #[serde(default)]
    pub agents: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonCatalog {
    Wrapped(AgentCatalog),
    Bare(Vec<CatalogEntry>),
}

impl AgentCatalog {
    /// Load a catalogue, picking the parser from the file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read agent catalog: {:?}", path))?;

        let catalog = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents)
                .with_context(|| format!("Failed to parse JSON agent catalog: {:?}", path))?,
            _ => Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse TOML agent catalog: {:?}", path))?,
        };

        catalog.validate()?;
        info!(path = ?path, agents = catalog.agents.len(), "agent catalog loaded");
        Ok(catalog)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        Ok(match serde_json::from_str::<JsonCatalog>(contents)? {
            JsonCatalog::Wrapped(catalog) => catalog,
            JsonCatalog::Bare(agents) => Self { agents },
        })
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.agents {
            if entry.name.trim().is_empty() {
                return Err(anyhow!("Agent catalog entries must have a non-empty name"));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(anyhow!("Duplicate agent '{}' in catalog", entry.name));
            }
        }
        Ok(())
    }

    /// Register every entry with a known kind. Returns the registered names.
    pub fn register_all(&self, registry: &AgentRegistry) -> Vec<String> {
        let mut registered = Vec::with_capacity(self.agents.len());
        for entry in &self.agents {
            let metadata = entry.metadata();
            let Some(ctor) = BuiltinAgents::constructor(entry.kind(), &entry.name, &metadata) else {
                warn!(agent = %entry.name, kind = %entry.kind(), "unknown agent kind, skipping");
                continue;
            };
            registry.register(entry.name.clone(), ctor, metadata);
            registered.push(entry.name.clone());
        }
        registered
    }
}
