//! Versioned, hot-swappable strategy features.

pub mod evaluator;
pub mod loader;
pub mod store;
pub mod synth;
pub mod version_store;
pub mod watcher;

pub use evaluator::{assess_performance, PerformanceEvaluator, PerformanceRecord, PerformanceSummary};
pub use loader::{DynamicLoader, FeatureUnit, LoadedFeature, SandboxLimits};
pub use store::{CycleOutcome, FeatureStore, FeatureStoreConfig};
pub use synth::ImprovementPolicy;
pub use version_store::{parse_version, FeatureArtifact, VersionStore};
pub use watcher::{FeatureEvent, FeatureWatcher};
