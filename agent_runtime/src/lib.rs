//! Agent Runtime - Core Library
//!
//! Agent registry and lifecycle management, plus a versioned feature store
//! whose strategy scripts are evaluated and rewritten when they underperform.

pub mod agent;
pub mod catalog;
pub mod cli;
pub mod error;
pub mod features;
pub mod lifecycle;
pub mod registry;
pub mod settings;
pub mod shutdown;
pub mod telemetry;

pub use agent::{Agent, AgentConstructor, AgentContext, AgentMetadata, BuiltinAgents};
pub use error::RuntimeError;
pub use features::{FeatureStore, FeatureStoreConfig, PerformanceEvaluator, VersionStore};
pub use lifecycle::{AgentLifecycleManager, LifecycleConfig};
pub use registry::{AgentRegistry, AgentStatus};
pub use shutdown::CancellationToken;
