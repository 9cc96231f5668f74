//! Feature store: write, load, evaluate and self-improve versioned strategies.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use super::evaluator::{PerformanceEvaluator, PerformanceRecord};
use super::loader::{DynamicLoader, LoadedFeature, SandboxLimits};
use super::synth::{synthesize, ImprovementPolicy};
use super::version_store::{parse_version, FeatureArtifact, VersionStore};
use crate::error::{panic_message, RuntimeError};
use crate::shutdown::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStoreConfig {
    pub directory: PathBuf,
    pub extension: String,
    pub max_versions: usize,
    pub history_limit: usize,
    pub loader_cache_size: usize,
    pub sandbox: SandboxLimits,
    pub policy: ImprovementPolicy,
}

impl Default for FeatureStoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./features"),
            extension: "rhai".to_string(),
            max_versions: 5,
            history_limit: 50,
            loader_cache_size: 64,
            sandbox: SandboxLimits::default(),
            policy: ImprovementPolicy::default(),
        }
    }
}

#[derive(Default)]
struct StoreState {
    /// Newest record at the back, bounded by `history_limit`.
    performance: HashMap<String, VecDeque<PerformanceRecord>>,
}

/// Outcome of one feature in a cycle pass: the base name and the improved
/// version written for it, if any.
pub type CycleOutcome = (String, Option<String>);

pub struct FeatureStore {
    versions: Arc<VersionStore>,
    loader: DynamicLoader,
    evaluator: PerformanceEvaluator,
    policy: ImprovementPolicy,
    history_limit: usize,
    /// Store-wide lock: one write/evaluate/improve at a time.
    state: Mutex<StoreState>,
}

impl FeatureStore {
    pub fn new(config: FeatureStoreConfig) -> Result<Self, RuntimeError> {
        if config.history_limit == 0 {
            return Err(RuntimeError::InvalidConfig(
                "history_limit must be at least 1".to_string(),
            ));
        }
        config.policy.validate()?;

        let versions = Arc::new(VersionStore::new(
            &config.directory,
            config.max_versions,
            &config.extension,
        )?);
        let loader = DynamicLoader::new(Arc::clone(&versions), &config.sandbox, config.loader_cache_size)?;

        info!(
            directory = ?config.directory,
            max_versions = config.max_versions,
            history_limit = config.history_limit,
            "feature store ready"
        );

        Ok(Self {
            versions,
            loader,
            evaluator: PerformanceEvaluator::new(),
            policy: config.policy,
            history_limit: config.history_limit,
            state: Mutex::new(StoreState::default()),
        })
    }

    pub fn version_store(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    pub fn policy(&self) -> &ImprovementPolicy {
        &self.policy
    }

    #[instrument(skip(self, code))]
    pub fn write(&self, name: &str, code: &str) -> Result<FeatureArtifact, RuntimeError> {
        let _state = self.state.lock();
        self.versions.write(name, code).map_err(|e| {
            error!(feature = %name, error = %e, "failed to write feature");
            e
        })
    }

    pub fn load(&self, name: &str) -> Result<LoadedFeature, RuntimeError> {
        self.loader.load(name)
    }

    /// Load, evaluate and record the performance of `name`.
    pub fn evaluate(&self, name: &str, data: &[Value]) -> Result<PerformanceRecord, RuntimeError> {
        let mut state = self.state.lock();
        self.evaluate_locked(&mut state, name, data)
    }

    fn evaluate_locked(
        &self,
        state: &mut StoreState,
        name: &str,
        data: &[Value],
    ) -> Result<PerformanceRecord, RuntimeError> {
        let unit = self.loader.load(name)?;
        let record = self.evaluator.evaluate(&unit, data)?;

        let history = state.performance.entry(record.feature.clone()).or_default();
        history.push_back(record.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
        Ok(record)
    }

    /// Evaluate the current artifact of `name` and, if it misses any
    /// threshold, write a corrected version. Returns the new version's name.
    #[instrument(skip(self, data), fields(records = data.len()))]
    pub fn self_improve(&self, name: &str, data: &[Value]) -> Option<String> {
        let mut state = self.state.lock();

        let record = match self.evaluate_locked(&mut state, name, data) {
            Ok(record) => record,
            Err(e) => {
                warn!(feature = %name, error = %e, "skipping improvement");
                return None;
            }
        };

        if !self.policy.needs_improvement(&record.summary) {
            debug!(feature = %record.feature, "performance within thresholds");
            return None;
        }

        let (base, _) = parse_version(&record.feature);
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        let version = match self.versions.next_version(base, now) {
            Ok(version) => version,
            Err(e) => {
                error!(feature = %base, error = %e, "could not determine next version");
                return None;
            }
        };
        let new_name = format!("{}_v{}", base, version);
        let code = synthesize(base, &record.summary, &self.policy);

        match self.versions.write(&new_name, &code) {
            Ok(_) => {
                info!(
                    feature = %base,
                    from = %record.feature,
                    to = %new_name,
                    profitability = record.summary.profitability,
                    success_rate = record.summary.success_rate,
                    max_drawdown = record.summary.max_drawdown,
                    "improved version written"
                );
                Some(new_name)
            }
            Err(e) => {
                error!(feature = %new_name, error = %e, "failed to write improved version");
                None
            }
        }
    }

    /// One pass of the continuous cycle over every stored base name.
    pub fn run_cycle(&self, data: &[Value]) -> Vec<CycleOutcome> {
        let names = self.feature_names();
        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            let improved = panic::catch_unwind(AssertUnwindSafe(|| self.self_improve(&name, data)))
                .unwrap_or_else(|payload| {
                    error!(feature = %name, panic = %panic_message(payload.as_ref()), "improvement panicked");
                    None
                });
            outcomes.push((name, improved));
        }
        outcomes
    }

    /// Repeat [`run_cycle`](Self::run_cycle) every `interval` until `token`
    /// is cancelled. Returns the number of completed passes.
    pub fn continuous_evaluation_cycle(
        &self,
        data: &[Value],
        interval: Duration,
        token: &CancellationToken,
    ) -> Result<u64, RuntimeError> {
        if interval.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "evaluation interval must be positive".to_string(),
            ));
        }

        info!(interval = ?interval, "continuous evaluation started");
        let mut passes = 0u64;
        while !token.is_cancelled() {
            let outcomes = self.run_cycle(data);
            passes += 1;
            let improved = outcomes.iter().filter(|(_, v)| v.is_some()).count();
            info!(pass = passes, features = outcomes.len(), improved, "evaluation pass complete");
            if token.wait_timeout(interval) {
                break;
            }
        }
        info!(passes, "continuous evaluation stopped");
        Ok(passes)
    }

    /// Distinct base names of stored artifacts.
    pub fn feature_names(&self) -> Vec<String> {
        self.versions.bases().unwrap_or_else(|e| {
            error!(error = %e, "failed to list features");
            Vec::new()
        })
    }

    /// Artifacts of `base`, oldest first.
    pub fn versions(&self, base: &str) -> Vec<FeatureArtifact> {
        self.versions.versions_of(base).unwrap_or_else(|e| {
            error!(feature = %base, error = %e, "failed to list versions");
            Vec::new()
        })
    }

    pub fn remove_feature(&self, name: &str) -> Result<bool, RuntimeError> {
        let mut state = self.state.lock();
        let removed = self.versions.remove(name)?;
        if removed {
            state.performance.remove(name);
            self.loader.invalidate(name);
        }
        Ok(removed)
    }

    /// Drop cached compiled code for `name`; the next load recompiles it.
    pub fn invalidate(&self, name: &str) {
        if self.loader.invalidate(name) {
            debug!(feature = %name, "compiled artifact evicted");
        }
    }

    pub fn latest_performance(&self, name: &str) -> Option<PerformanceRecord> {
        self.state
            .lock()
            .performance
            .get(name)
            .and_then(|history| history.back().cloned())
    }

    /// Recorded evaluations of `name`, oldest first.
    pub fn performance_history(&self, name: &str) -> Vec<PerformanceRecord> {
        self.state
            .lock()
            .performance
            .get(name)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }
}
