//! Durable, version-qualified storage of feature artifacts.
//!
//! Artifacts live as `<name>.<ext>` in a single directory. Improved versions
//! are named `<base>_v<number>`; retention keeps the newest `max_versions`
//! artifacts per base name.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::error::RuntimeError;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").expect("valid feature name regex"));

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<base>.+?)_v(?P<ver>\d+)$").expect("valid version regex"));

/// Split an artifact stem into its base name and version number.
///
/// A missing or malformed suffix yields version 0 and the whole stem as the
/// base; a suffix too large for `u64` also counts as version 0.
pub fn parse_version(stem: &str) -> (&str, u64) {
    match VERSION_RE.captures(stem) {
        Some(caps) => {
            let base = caps.name("base").map_or(stem, |m| m.as_str());
            let version = caps
                .name("ver")
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .unwrap_or(0);
            (base, version)
        }
        None => (stem, 0),
    }
}

pub fn validate_name(name: &str) -> Result<(), RuntimeError> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(RuntimeError::InvalidFeatureName(name.to_string()))
    }
}

/// One stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureArtifact {
    pub name: String,
    pub base: String,
    pub version: u64,
    pub path: PathBuf,
}

impl FeatureArtifact {
    fn from_stem(stem: &str, path: PathBuf) -> Self {
        let (base, version) = parse_version(stem);
        Self {
            name: stem.to_string(),
            base: base.to_string(),
            version,
            path,
        }
    }
}

#[derive(Debug)]
pub struct VersionStore {
    dir: PathBuf,
    max_versions: usize,
    extension: String,
    /// One lock per base name; writers to different bases do not contend.
    base_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VersionStore {
    pub fn new(dir: impl Into<PathBuf>, max_versions: usize, extension: &str) -> Result<Self, RuntimeError> {
        if max_versions == 0 {
            return Err(RuntimeError::InvalidConfig(
                "max_versions must be at least 1".to_string(),
            ));
        }
        let extension = extension.trim_start_matches('.');
        if extension.is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "feature extension must not be empty".to_string(),
            ));
        }

        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| RuntimeError::PersistenceFailure {
            name: dir.display().to_string(),
            source,
        })?;

        Ok(Self {
            dir,
            max_versions,
            extension: extension.to_string(),
            base_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn max_versions(&self) -> usize {
        self.max_versions
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, self.extension))
    }

    fn base_lock(&self, base: &str) -> Arc<Mutex<()>> {
        self.base_locks
            .lock()
            .entry(base.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Persist `code` under `name` (temp file + rename), then apply retention
    /// to the name's base.
    #[instrument(skip(self, code), fields(bytes = code.len()))]
    pub fn write(&self, name: &str, code: &str) -> Result<FeatureArtifact, RuntimeError> {
        validate_name(name)?;
        let (base, _) = parse_version(name);
        let lock = self.base_lock(base);
        let _guard = lock.lock();

        let path = self.path_for(name);
        let persist_err = |source: io::Error| RuntimeError::PersistenceFailure {
            name: name.to_string(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(persist_err)?;
        tmp.write_all(code.as_bytes()).map_err(persist_err)?;
        tmp.as_file().sync_all().map_err(persist_err)?;
        tmp.persist(&path).map_err(|e| persist_err(e.error))?;

        info!(feature = %name, path = ?path, "feature artifact written");

        let removed = self.cleanup_locked(base);
        if removed > 0 {
            debug!(feature = %name, base = %base, removed, "retention applied");
        }

        Ok(FeatureArtifact::from_stem(name, path))
    }

    /// Delete all but the newest `max_versions` artifacts sharing the base of
    /// `name`. Returns how many were removed.
    pub fn cleanup(&self, name: &str) -> usize {
        let (base, _) = parse_version(name);
        let lock = self.base_lock(base);
        let _guard = lock.lock();
        self.cleanup_locked(base)
    }

    fn cleanup_locked(&self, base: &str) -> usize {
        let versions = match self.versions_of(base) {
            Ok(versions) => versions,
            Err(e) => {
                warn!(base = %base, error = %e, "could not list versions for cleanup");
                return 0;
            }
        };
        if versions.len() <= self.max_versions {
            return 0;
        }

        let surplus = versions.len() - self.max_versions;
        let mut removed = 0;
        for artifact in versions.into_iter().take(surplus) {
            match fs::remove_file(&artifact.path) {
                Ok(()) => {
                    removed += 1;
                    info!(feature = %artifact.name, version = artifact.version, "old version removed");
                }
                Err(e) => warn!(feature = %artifact.name, error = %e, "failed to remove old version"),
            }
        }
        removed
    }

    /// Every artifact in the directory, ordered by base then version.
    pub fn list(&self) -> Result<Vec<FeatureArtifact>, RuntimeError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| RuntimeError::PersistenceFailure {
            name: self.dir.display().to_string(),
            source,
        })?;

        let mut artifacts = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            if let Some(stem) = self.artifact_stem(&path) {
                artifacts.push(FeatureArtifact::from_stem(&stem, path));
            }
        }

        artifacts.sort_by(|a, b| {
            (a.base.as_str(), a.version, a.name.as_str()).cmp(&(b.base.as_str(), b.version, b.name.as_str()))
        });
        Ok(artifacts)
    }

    /// Stem of `path` if it is an artifact file of this store.
    pub fn artifact_stem(&self, path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        NAME_RE.is_match(stem).then(|| stem.to_string())
    }

    /// Artifacts whose base is exactly `base`, oldest first.
    pub fn versions_of(&self, base: &str) -> Result<Vec<FeatureArtifact>, RuntimeError> {
        Ok(self.list()?.into_iter().filter(|a| a.base == base).collect())
    }

    pub fn latest(&self, base: &str) -> Result<Option<FeatureArtifact>, RuntimeError> {
        Ok(self.versions_of(base)?.pop())
    }

    /// The newest version of `name` taken as a base (an unsuffixed `name`
    /// counts as version 0), else the artifact named exactly `name`.
    pub fn resolve(&self, name: &str) -> Result<Option<FeatureArtifact>, RuntimeError> {
        validate_name(name)?;
        if let Some(latest) = self.latest(name)? {
            return Ok(Some(latest));
        }
        let path = self.path_for(name);
        Ok(path.is_file().then(|| FeatureArtifact::from_stem(name, path)))
    }

    pub fn read(&self, artifact: &FeatureArtifact) -> Result<String, RuntimeError> {
        fs::read_to_string(&artifact.path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                RuntimeError::feature_not_found(&artifact.name)
            } else {
                RuntimeError::PersistenceFailure {
                    name: artifact.name.clone(),
                    source,
                }
            }
        })
    }

    /// Distinct base names, sorted.
    pub fn bases(&self) -> Result<Vec<String>, RuntimeError> {
        let bases: BTreeSet<String> = self.list()?.into_iter().map(|a| a.base).collect();
        Ok(bases.into_iter().collect())
    }

    /// Delete the artifact named exactly `name`. `Ok(false)` if it did not exist.
    pub fn remove(&self, name: &str) -> Result<bool, RuntimeError> {
        validate_name(name)?;
        let (base, _) = parse_version(name);
        let lock = self.base_lock(base);
        let _guard = lock.lock();

        match fs::remove_file(self.path_for(name)) {
            Ok(()) => {
                info!(feature = %name, "feature artifact removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(RuntimeError::PersistenceFailure {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Version number for the next improvement of `base`: the current epoch
    /// second, bumped past the newest stored version if needed.
    pub fn next_version(&self, base: &str, now_epoch_secs: u64) -> Result<u64, RuntimeError> {
        let newest = self
            .versions_of(base)?
            .iter()
            .map(|a| a.version)
            .max()
            .unwrap_or(0);
        Ok(now_epoch_secs.max(newest.saturating_add(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(max_versions: usize) -> (TempDir, VersionStore) {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path(), max_versions, "rhai").unwrap();
        (dir, store)
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("momentum"), ("momentum", 0));
        assert_eq!(parse_version("momentum_v1700000000"), ("momentum", 1700000000));
        assert_eq!(parse_version("mean_rev_v2_v9"), ("mean_rev_v2", 9));
        assert_eq!(parse_version("momentum_vbeta"), ("momentum_vbeta", 0));
        assert_eq!(parse_version("momentum_v"), ("momentum_v", 0));
        assert_eq!(parse_version("m_v99999999999999999999999"), ("m", 0));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("momentum_v12").is_ok());
        assert!(validate_name("a-b").is_ok());
        for bad in ["", "../etc", "a b", "_hidden", "x.rhai", "a/b"] {
            assert!(
                matches!(validate_name(bad), Err(RuntimeError::InvalidFeatureName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_retention_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            VersionStore::new(dir.path(), 0, "rhai"),
            Err(RuntimeError::InvalidConfig(_))
        ));
        assert!(VersionStore::new(dir.path(), 1, "").is_err());
    }

    #[test]
    fn test_write_and_resolve() {
        let (_dir, store) = store(5);
        let artifact = store.write("momentum", "fn new_strategy(d) { d }").unwrap();
        assert_eq!(artifact.base, "momentum");
        assert_eq!(artifact.version, 0);
        assert!(artifact.path.ends_with("momentum.rhai"));

        let resolved = store.resolve("momentum").unwrap().unwrap();
        assert_eq!(store.read(&resolved).unwrap(), "fn new_strategy(d) { d }");
        assert!(store.resolve("absent").unwrap().is_none());
    }

    #[test]
    fn test_resolve_falls_back_to_newest_version() {
        let (_dir, store) = store(5);
        store.write("trend_v3", "3").unwrap();
        store.write("trend_v10", "10").unwrap();
        let resolved = store.resolve("trend").unwrap().unwrap();
        assert_eq!(resolved.name, "trend_v10");

        store.write("trend", "0").unwrap();
        assert_eq!(store.resolve("trend").unwrap().unwrap().name, "trend_v10");
        assert_eq!(store.resolve("trend_v3").unwrap().unwrap().name, "trend_v3");
    }

    #[test]
    fn test_cleanup_keeps_newest() {
        let (_dir, store) = store(2);
        store.write("alpha", "0").unwrap();
        store.write("alpha_v5", "5").unwrap();
        store.write("alpha_v7", "7").unwrap();
        store.write("alpha_v6", "6").unwrap();

        let names: Vec<String> = store.versions_of("alpha").unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["alpha_v6", "alpha_v7"]);
    }

    #[test]
    fn test_bases_are_matched_exactly() {
        let (_dir, store) = store(1);
        store.write("alpha", "a").unwrap();
        store.write("alphabet", "b").unwrap();
        store.write("alpha_beta", "c").unwrap();

        assert_eq!(store.bases().unwrap(), vec!["alpha", "alpha_beta", "alphabet"]);
        assert_eq!(store.versions_of("alpha").unwrap().len(), 1);
        assert_eq!(store.list().unwrap().len(), 3);
    }

    #[test]
    fn test_foreign_files_ignored() {
        let (dir, store) = store(5);
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join(".tmpabc"), "x").unwrap();
        fs::write(dir.path().join("bad name.rhai"), "x").unwrap();
        store.write("real", "1").unwrap();

        let names: Vec<String> = store.list().unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["real"]);
    }

    #[test]
    fn test_remove() {
        let (_dir, store) = store(5);
        store.write("gone", "1").unwrap();
        assert!(store.remove("gone").unwrap());
        assert!(!store.remove("gone").unwrap());
        assert!(store.resolve("gone").unwrap().is_none());
    }

    #[test]
    fn test_next_version_is_strictly_increasing() {
        let (_dir, store) = store(5);
        assert_eq!(store.next_version("beta", 1_000).unwrap(), 1_000);
        store.write("beta_v1000", "x").unwrap();
        assert_eq!(store.next_version("beta", 1_000).unwrap(), 1_001);
        assert_eq!(store.next_version("beta", 5_000).unwrap(), 5_000);
    }

    #[test]
    fn test_overwrite_same_name() {
        let (_dir, store) = store(5);
        store.write("same", "old").unwrap();
        let artifact = store.write("same", "new").unwrap();
        assert_eq!(store.read(&artifact).unwrap(), "new");
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
