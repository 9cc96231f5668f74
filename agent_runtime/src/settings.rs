//! Layered configuration: embedded defaults, optional file, environment.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::features::{FeatureStoreConfig, ImprovementPolicy, SandboxLimits};
use crate::lifecycle::{LifecycleConfig, RestartArgs};

/// Prefix for environment overrides, e.g. `AGENT_RUNTIME__FEATURES__MAX_VERSIONS=3`.
pub const ENV_PREFIX: &str = "AGENT_RUNTIME";

/// Local override file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "agent_runtime";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_target: bool,
    pub enable_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_target: false,
            enable_thread_ids: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    pub directory: PathBuf,
    pub extension: String,
    pub max_versions: usize,
    /// Performance records kept per artifact.
    pub history_limit: usize,
    pub loader_cache_size: usize,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("features"),
            extension: "rhai".to_string(),
            max_versions: 5,
            history_limit: 50,
            loader_cache_size: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub interval_secs: u64,
    pub min_profitability: f64,
    pub min_success_rate: f64,
    pub min_max_drawdown: f64,
    pub profit_correction: f64,
    pub risk_correction: f64,
    pub risk_drawdown_trigger: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        let policy = ImprovementPolicy::default();
        Self {
            interval_secs: 3_600,
            min_profitability: policy.min_profitability,
            min_success_rate: policy.min_success_rate,
            min_max_drawdown: policy.min_max_drawdown,
            profit_correction: policy.profit_correction,
            risk_correction: policy.risk_correction,
            risk_drawdown_trigger: policy.risk_drawdown_trigger,
        }
    }
}

impl EvaluationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn policy(&self) -> ImprovementPolicy {
        ImprovementPolicy {
            min_profitability: self.min_profitability,
            min_success_rate: self.min_success_rate,
            min_max_drawdown: self.min_max_drawdown,
            profit_correction: self.profit_correction,
            risk_correction: self.risk_correction,
            risk_drawdown_trigger: self.risk_drawdown_trigger,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSettings {
    pub join_timeout_secs: u64,
    pub restart_args: RestartArgs,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            join_timeout_secs: 5,
            restart_args: RestartArgs::Supplied,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Agent catalogue registered at startup.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub features: FeaturesConfig,
    pub sandbox: SandboxLimits,
    pub evaluation: EvaluationConfig,
    pub lifecycle: LifecycleSettings,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, `agent_runtime.toml` (if
    /// present) and `AGENT_RUNTIME__*` environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// As [`load`](Self::load), with `path` replacing the local override file.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        Self::build(path, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn build(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder().add_source(File::from_str(
            include_str!("../config.toml"),
            FileFormat::Toml,
        ));

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(LOCAL_CONFIG).required(false)),
        };

        let config = builder
            .add_source(env)
            .build()
            .context("Failed to assemble configuration")?;

        let settings: Settings = config
            .try_deserialize()
            .context("Invalid configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(anyhow!(
                "Unknown log format '{}', expected 'text' or 'json'",
                self.logging.format
            ));
        }

        if self.features.max_versions == 0 {
            return Err(anyhow!("features.max_versions must be at least 1"));
        }
        if self.features.history_limit == 0 {
            return Err(anyhow!("features.history_limit must be at least 1"));
        }
        if self.features.loader_cache_size == 0 {
            return Err(anyhow!("features.loader_cache_size must be at least 1"));
        }
        if self.features.extension.trim_start_matches('.').is_empty() {
            return Err(anyhow!("features.extension must not be empty"));
        }
        if !self.features.directory.exists() {
            warn!("Feature directory does not exist yet: {:?}", self.features.directory);
        }

        if self.evaluation.interval_secs == 0 {
            return Err(anyhow!("evaluation.interval_secs must be positive"));
        }
        self.evaluation.policy().validate()?;

        if self.lifecycle.join_timeout_secs == 0 {
            return Err(anyhow!("lifecycle.join_timeout_secs must be positive"));
        }

        Ok(())
    }

    pub fn feature_store_config(&self) -> FeatureStoreConfig {
        FeatureStoreConfig {
            directory: self.features.directory.clone(),
            extension: self.features.extension.clone(),
            max_versions: self.features.max_versions,
            history_limit: self.features.history_limit,
            loader_cache_size: self.features.loader_cache_size,
            sandbox: self.sandbox.clone(),
            policy: self.evaluation.policy(),
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            join_timeout: Duration::from_secs(self.lifecycle.join_timeout_secs),
            restart_args: self.lifecycle.restart_args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::environment().source(Some(map))
    }

    #[test]
    fn test_embedded_defaults() {
        let settings = Settings::build(None, env(&[])).unwrap();
        assert_eq!(settings.features.max_versions, 5);
        assert_eq!(settings.features.extension, "rhai");
        assert_eq!(settings.evaluation.interval(), Duration::from_secs(3_600));
        assert_eq!(settings.evaluation.policy(), ImprovementPolicy::default());
        assert_eq!(settings.lifecycle.restart_args, RestartArgs::Supplied);
        assert_eq!(settings.sandbox, SandboxLimits::default());
        assert!(settings.agents.catalog.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings::build(
            None,
            env(&[
                ("AGENT_RUNTIME__FEATURES__MAX_VERSIONS", "3"),
                ("AGENT_RUNTIME__LIFECYCLE__RESTART_ARGS", "original"),
                ("AGENT_RUNTIME__LOGGING__FORMAT", "json"),
            ]),
        )
        .unwrap();
        assert_eq!(settings.features.max_versions, 3);
        assert_eq!(settings.lifecycle.restart_args, RestartArgs::Original);
        assert_eq!(settings.logging.format, "json");
    }

    #[test]
    fn test_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[evaluation]\ninterval_secs = 60\n[agents]\ncatalog = \"agents.toml\"").unwrap();

        let settings = Settings::build(Some(file.path()), env(&[])).unwrap();
        assert_eq!(settings.evaluation.interval_secs, 60);
        assert_eq!(settings.evaluation.min_success_rate, 0.6);
        assert_eq!(settings.agents.catalog, Some(PathBuf::from("agents.toml")));
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        assert!(Settings::build(Some(Path::new("/no/such/runtime.toml")), env(&[])).is_err());
    }

    #[test]
    fn test_validation_failures() {
        for (key, value) in [
            ("AGENT_RUNTIME__FEATURES__MAX_VERSIONS", "0"),
            ("AGENT_RUNTIME__EVALUATION__INTERVAL_SECS", "0"),
            ("AGENT_RUNTIME__EVALUATION__PROFIT_CORRECTION", "0.5"),
            ("AGENT_RUNTIME__LIFECYCLE__JOIN_TIMEOUT_SECS", "0"),
            ("AGENT_RUNTIME__LOGGING__FORMAT", "xml"),
        ] {
            assert!(Settings::build(None, env(&[(key, value)])).is_err(), "{key}={value} should fail");
        }
    }

    #[test]
    fn test_derived_configs() {
        let settings = Settings::default();
        let store = settings.feature_store_config();
        assert_eq!(store.max_versions, settings.features.max_versions);
        assert_eq!(store.policy, settings.evaluation.policy());
        assert_eq!(settings.lifecycle_config().join_timeout, Duration::from_secs(5));
    }
}
