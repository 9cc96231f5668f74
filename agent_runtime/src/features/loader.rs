//! Turns stored artifacts into invocable strategy units.
//!
//! Artifacts are Rhai scripts compiled by one sandboxed engine. Compiled
//! ASTs are cached by artifact name and revalidated against the sha256 of the
//! file contents, so rewriting an artifact on disk swaps it in on next load.

use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rhai::{Array, CallFnOptions, Dynamic, Engine, ImmutableString, Map, Scope, AST, FLOAT, INT};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::version_store::{validate_name, FeatureArtifact, VersionStore};
use crate::error::{panic_message, RuntimeError};

/// Entry point every feature artifact must define.
pub const ENTRY_POINT: &str = "new_strategy";

/// An invocable strategy unit.
pub trait FeatureUnit: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the unit defines `new_strategy` taking one argument.
    fn has_entry_point(&self) -> bool;

    /// Run the strategy over `data` and return its raw output.
    fn new_strategy(&self, data: &[Value]) -> Result<Value, RuntimeError>;
}

/// Resource limits applied to every script evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            max_call_levels: 32,
            max_expr_depth: 64,
            max_string_size: 1 << 20,
            max_array_size: 100_000,
            max_map_size: 10_000,
        }
    }
}

pub fn sandboxed_engine(limits: &SandboxLimits) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);
    engine.disable_symbol("eval");
    engine
}

pub(crate) fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// A compiled artifact with its top-level statements already run.
pub struct LoadedFeature {
    name: String,
    artifact: FeatureArtifact,
    hash: String,
    engine: Arc<Engine>,
    ast: Arc<AST>,
    scope: Scope<'static>,
}

impl LoadedFeature {
    pub fn artifact(&self) -> &FeatureArtifact {
        &self.artifact
    }

    /// sha256 of the source the unit was compiled from.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Debug for LoadedFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedFeature")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .finish()
    }
}

impl FeatureUnit for LoadedFeature {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_entry_point(&self) -> bool {
        self.ast
            .iter_functions()
            .any(|f| f.name == ENTRY_POINT && f.params.len() == 1)
    }

    fn new_strategy(&self, data: &[Value]) -> Result<Value, RuntimeError> {
        if !self.has_entry_point() {
            return Err(RuntimeError::ContractViolation {
                name: self.name.clone(),
                reason: format!("missing `{}(data)` entry point", ENTRY_POINT),
            });
        }

        let input: Array = data.iter().map(json_to_dynamic).collect();
        let mut scope = self.scope.clone();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let output: Dynamic = self
            .engine
            .call_fn_with_options(options, &mut scope, &self.ast, ENTRY_POINT, (input,))
            .map_err(|e| RuntimeError::EvaluationFailure {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        dynamic_to_json(output).map_err(|reason| RuntimeError::ContractViolation {
            name: self.name.clone(),
            reason,
        })
    }
}

struct CachedAst {
    hash: String,
    ast: Arc<AST>,
}

pub struct DynamicLoader {
    store: Arc<VersionStore>,
    engine: Arc<Engine>,
    cache: Mutex<LruCache<String, CachedAst>>,
}

impl DynamicLoader {
    pub fn new(store: Arc<VersionStore>, limits: &SandboxLimits, cache_size: usize) -> Result<Self, RuntimeError> {
        let capacity = NonZeroUsize::new(cache_size)
            .ok_or_else(|| RuntimeError::InvalidConfig("loader cache size must be at least 1".to_string()))?;
        Ok(Self {
            store,
            engine: Arc::new(sandboxed_engine(limits)),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Load `name` exactly, or the newest stored version of `name` as a base.
    pub fn load(&self, name: &str) -> Result<LoadedFeature, RuntimeError> {
        validate_name(name)?;
        let artifact = self
            .store
            .resolve(name)?
            .ok_or_else(|| RuntimeError::feature_not_found(name))?;
        let source = self.store.read(&artifact)?;
        let hash = content_hash(source.as_bytes());

        let load_failure = |reason: String| RuntimeError::LoadFailure {
            name: artifact.name.clone(),
            reason,
        };

        let ast = match self.cached(&artifact.name, &hash) {
            Some(ast) => {
                debug!(feature = %artifact.name, "compiled artifact served from cache");
                ast
            }
            None => {
                let compiled = panic::catch_unwind(AssertUnwindSafe(|| self.engine.compile(&source)))
                    .map_err(|payload| load_failure(format!("compiler panicked: {}", panic_message(payload.as_ref()))))?
                    .map_err(|e| load_failure(e.to_string()))?;
                let ast = Arc::new(compiled);
                self.cache.lock().put(
                    artifact.name.clone(),
                    CachedAst {
                        hash: hash.clone(),
                        ast: Arc::clone(&ast),
                    },
                );
                ast
            }
        };

        // Top-level statements run once per load, into a scope private to this unit.
        let mut scope = Scope::new();
        panic::catch_unwind(AssertUnwindSafe(|| self.engine.run_ast_with_scope(&mut scope, &ast)))
            .map_err(|payload| load_failure(format!("script panicked: {}", panic_message(payload.as_ref()))))?
            .map_err(|e| {
                warn!(feature = %artifact.name, error = %e, "artifact failed during load");
                load_failure(e.to_string())
            })?;

        info!(feature = %artifact.name, requested = %name, hash = %&hash[..12], "feature loaded");
        Ok(LoadedFeature {
            name: artifact.name.clone(),
            artifact,
            hash,
            engine: Arc::clone(&self.engine),
            ast,
            scope,
        })
    }

    fn cached(&self, name: &str, hash: &str) -> Option<Arc<AST>> {
        let mut cache = self.cache.lock();
        match cache.get(name) {
            Some(entry) if entry.hash == hash => Some(Arc::clone(&entry.ast)),
            Some(_) => {
                cache.pop(name);
                None
            }
            None => None,
        }
    }

    /// Drop any cached AST for `name`.
    pub fn invalidate(&self, name: &str) -> bool {
        self.cache.lock().pop(name).is_some()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Numbers cross into scripts as floats.
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => Dynamic::from(n.as_f64().unwrap_or(0.0) as FLOAT),
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => Dynamic::from_array(items.iter().map(json_to_dynamic).collect()),
        Value::Object(fields) => {
            let mut map = Map::new();
            for (key, field) in fields {
                map.insert(key.as_str().into(), json_to_dynamic(field));
            }
            Dynamic::from_map(map)
        }
    }
}

pub fn dynamic_to_json(value: Dynamic) -> Result<Value, String> {
    let type_name = value.type_name();
    let unsupported = || format!("unsupported value of type `{}`", type_name);

    if value.is::<()>() {
        return Ok(Value::Null);
    }
    if value.is::<bool>() {
        return value.try_cast::<bool>().map(Value::Bool).ok_or_else(unsupported);
    }
    if value.is::<INT>() {
        return value.try_cast::<INT>().map(Value::from).ok_or_else(unsupported);
    }
    if value.is::<FLOAT>() {
        let f = value.try_cast::<FLOAT>().ok_or_else(unsupported)?;
        return Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite number {}", f));
    }
    if value.is::<char>() {
        return value
            .try_cast::<char>()
            .map(|c| Value::String(c.to_string()))
            .ok_or_else(unsupported);
    }
    if value.is::<ImmutableString>() {
        return value
            .try_cast::<ImmutableString>()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(unsupported);
    }
    if value.is::<Array>() {
        let items = value.try_cast::<Array>().ok_or_else(unsupported)?;
        return items
            .into_iter()
            .map(dynamic_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }
    if value.is::<Map>() {
        let map = value.try_cast::<Map>().ok_or_else(unsupported)?;
        let mut object = serde_json::Map::with_capacity(map.len());
        for (key, field) in map {
            object.insert(key.to_string(), dynamic_to_json(field)?);
        }
        return Ok(Value::Object(object));
    }
    Err(unsupported())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const DOUBLER: &str = r#"
        let label = "doubler";
        fn new_strategy(data) {
            let out = [];
            for row in data {
                out.push(#{ profit: row.expected_return * 2.0 });
            }
            out
        }
    "#;

    fn setup() -> (TempDir, Arc<VersionStore>, DynamicLoader) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(VersionStore::new(dir.path(), 5, "rhai").unwrap());
        let loader = DynamicLoader::new(store.clone(), &SandboxLimits::default(), 8).unwrap();
        (dir, store, loader)
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let (_dir, store, loader) = setup();
        store.write("doubler", DOUBLER).unwrap();

        let unit = loader.load("doubler").unwrap();
        assert_eq!(unit.name(), "doubler");
        assert!(unit.has_entry_point());

        let out = unit
            .new_strategy(&[json!({"expected_return": 3}), json!({"expected_return": -1.5})])
            .unwrap();
        assert_eq!(out, json!([{"profit": 6.0}, {"profit": -3.0}]));
    }

    #[test]
    fn test_missing_artifact_is_not_found() {
        let (_dir, _store, loader) = setup();
        assert!(loader.load("ghost").unwrap_err().is_not_found());
        assert!(matches!(
            loader.load("../ghost").unwrap_err(),
            RuntimeError::InvalidFeatureName(_)
        ));
    }

    #[test]
    fn test_syntax_error_is_load_failure() {
        let (_dir, store, loader) = setup();
        store.write("broken", "fn new_strategy(data) { let = ; }").unwrap();
        assert!(matches!(loader.load("broken").unwrap_err(), RuntimeError::LoadFailure { .. }));
    }

    #[test]
    fn test_top_level_error_is_load_failure() {
        let (_dir, store, loader) = setup();
        store.write("throws", "throw \"bad init\";\nfn new_strategy(d) { d }").unwrap();
        let err = loader.load("throws").unwrap_err();
        assert!(matches!(err, RuntimeError::LoadFailure { ref reason, .. } if reason.contains("bad init")));
    }

    #[test]
    fn test_missing_entry_point_is_contract_violation() {
        let (_dir, store, loader) = setup();
        store.write("hollow", "fn other(d) { d }").unwrap();
        let unit = loader.load("hollow").unwrap();
        assert!(!unit.has_entry_point());
        assert!(matches!(
            unit.new_strategy(&[]).unwrap_err(),
            RuntimeError::ContractViolation { .. }
        ));
    }

    #[test]
    fn test_runaway_script_is_stopped() {
        let (_dir, store, loader) = setup();
        store.write("spin", "fn new_strategy(d) { loop { } }").unwrap();
        let unit = loader.load("spin").unwrap();
        assert!(matches!(
            unit.new_strategy(&[]).unwrap_err(),
            RuntimeError::EvaluationFailure { .. }
        ));
    }

    #[test]
    fn test_eval_is_disabled() {
        let (_dir, store, loader) = setup();
        store.write("sneaky", "fn new_strategy(d) { eval(\"40 + 2\") }").unwrap();
        assert!(loader.load("sneaky").is_err());
    }

    #[test]
    fn test_rewrite_is_picked_up() {
        let (_dir, store, loader) = setup();
        store.write("swap", "fn new_strategy(d) { [#{profit: 1.0}] }").unwrap();
        let first = loader.load("swap").unwrap();
        assert_eq!(loader.cached_len(), 1);

        store.write("swap", "fn new_strategy(d) { [#{profit: 2.0}] }").unwrap();
        let second = loader.load("swap").unwrap();
        assert_ne!(first.hash(), second.hash());
        assert_eq!(second.new_strategy(&[]).unwrap(), json!([{"profit": 2.0}]));

        assert!(loader.invalidate("swap"));
        assert!(!loader.invalidate("swap"));
    }

    #[test]
    fn test_base_name_loads_newest_version() {
        let (_dir, store, loader) = setup();
        store.write("trend_v1", "fn new_strategy(d) { [#{profit: 1.0}] }").unwrap();
        store.write("trend_v2", "fn new_strategy(d) { [#{profit: 2.0}] }").unwrap();
        let unit = loader.load("trend").unwrap();
        assert_eq!(unit.name(), "trend_v2");
        assert_eq!(unit.artifact().version, 2);
    }

    #[test]
    fn test_zero_cache_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(VersionStore::new(dir.path(), 5, "rhai").unwrap());
        assert!(DynamicLoader::new(store, &SandboxLimits::default(), 0).is_err());
    }

    #[test]
    fn test_value_conversion() {
        let input = json!({"a": [1, true, null, "s"], "b": {"c": 2.5}});
        let back = dynamic_to_json(json_to_dynamic(&input)).unwrap();
        assert_eq!(back, json!({"a": [1.0, true, null, "s"], "b": {"c": 2.5}}));

        assert_eq!(dynamic_to_json(Dynamic::from(7 as INT)).unwrap(), json!(7));
        assert!(dynamic_to_json(Dynamic::from(FLOAT::NAN)).is_err());
    }
}
