//! Named stages and the values they hand to each other.
//!
//! A stage named `deploy` is skipped when `SKIP_deploy` is set, so a run
//! can be resumed against infrastructure an earlier run left behind. Values
//! that later stages need (image ids, terraform options, key pairs) go
//! through a [`StageStore`] so they survive between processes when the
//! store is file-backed.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};

/// Key/value storage shared by the stages of one scenario.
pub trait StageStore: Send + Sync {
    /// Store a JSON document under `key`.
    ///
    /// # Errors
    /// Returns [`HarnessError::Stage`] if the value cannot be stored.
    fn save_raw(&self, key: &str, json: String) -> Result<()>;

    /// The JSON document stored under `key`, if any.
    ///
    /// # Errors
    /// Returns [`HarnessError::Stage`] if the store cannot be read.
    fn load_raw(&self, key: &str) -> Result<Option<String>>;

    /// Forget whatever is stored under `key`. Missing keys are not an error.
    ///
    /// # Errors
    /// Returns [`HarnessError::Stage`] if the value cannot be removed.
    fn remove_raw(&self, key: &str) -> Result<()>;
}

/// Serialize and store `value` under `key`.
///
/// # Errors
/// Returns [`HarnessError::Stage`] on serialization or storage failure.
pub fn save<T: Serialize + ?Sized>(store: &dyn StageStore, key: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| HarnessError::Stage(format!("cannot serialize {key}: {e}")))?;
    store.save_raw(key, json)
}

/// Load a value an earlier stage saved.
///
/// # Errors
/// Returns [`HarnessError::Stage`] if nothing was saved under `key` or the
/// value does not deserialize.
pub fn load<T: DeserializeOwned>(store: &dyn StageStore, key: &str) -> Result<T> {
    let json = store
        .load_raw(key)?
        .ok_or_else(|| HarnessError::Stage(format!("no saved value for {key}")))?;
    serde_json::from_str(&json).map_err(|e| HarnessError::Stage(format!("cannot parse saved {key}: {e}")))
}

/// Drop values a previous run left under `keys`.
///
/// # Errors
/// Returns [`HarnessError::Stage`] if a value cannot be removed.
pub fn clear(store: &dyn StageStore, keys: &[&str]) -> Result<()> {
    for key in keys {
        store.remove_raw(key)?;
    }
    Ok(())
}

/// In-memory [`StageStore`].
#[derive(Debug, Default)]
pub struct MemoryStageStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStageStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StageStore for MemoryStageStore {
    fn save_raw(&self, key: &str, json: String) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| HarnessError::Stage("stage store lock poisoned".to_string()))?
            .insert(key.to_string(), json);
        Ok(())
    }

    fn load_raw(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .map_err(|_| HarnessError::Stage("stage store lock poisoned".to_string()))?
            .get(key)
            .cloned())
    }

    fn remove_raw(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| HarnessError::Stage("stage store lock poisoned".to_string()))?
            .remove(key);
        Ok(())
    }
}

/// [`StageStore`] keeping one JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStageStore {
    dir: PathBuf,
}

impl FileStageStore {
    /// Store files under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// A store for a sub-namespace (e.g. one scenario).
    #[must_use]
    pub fn scoped(&self, name: &str) -> Self {
        Self::new(self.dir.join(name))
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl StageStore for FileStageStore {
    fn save_raw(&self, key: &str, json: String) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| HarnessError::Stage(format!("cannot create {}: {e}", self.dir.display())))?;

        let path = self.path(key);
        std::fs::write(&path, json)
            .map_err(|e| HarnessError::Stage(format!("cannot write {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Saved stage value");
        Ok(())
    }

    fn load_raw(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| HarnessError::Stage(format!("cannot read {}: {e}", path.display())))
    }

    fn remove_raw(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed stage value");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HarnessError::Stage(format!("cannot remove {}: {e}", path.display()))),
        }
    }
}

/// Whether `SKIP_<name>` is set in the environment.
#[must_use]
pub fn should_skip(name: &str) -> bool {
    std::env::var_os(format!("SKIP_{name}")).is_some()
}

/// Run `stage` unless it is skipped through the environment.
///
/// # Errors
/// Returns whatever the stage returns.
pub async fn run_stage<F, Fut, E>(name: &str, stage: F) -> std::result::Result<(), E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
{
    if should_skip(name) {
        info!(stage = name, "The 'SKIP_{name}' environment variable is set, so skipping stage '{name}'.");
        return Ok(());
    }

    info!(stage = name, "The 'SKIP_{name}' environment variable is not set, so executing stage '{name}'.");
    stage().await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use serial_test::serial;

    use super::*;

    #[test]
    fn test_file_store_round_trip_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStageStore::new(dir.path()).scoped("public");
        save(&store, "GcpRegionName", "us-east1").unwrap();
        save(&store, "vars", &BTreeMap::from([("a", 1)])).unwrap();

        let reopened = FileStageStore::new(dir.path()).scoped("public");
        assert_eq!(load::<String>(&reopened, "GcpRegionName").unwrap(), "us-east1");
        assert_eq!(
            load::<BTreeMap<String, i32>>(&reopened, "vars").unwrap(),
            BTreeMap::from([("a".to_string(), 1)])
        );
        assert!(dir.path().join("public/GcpRegionName.json").exists());
    }

    #[test]
    fn test_clear_forgets_saved_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStageStore::new(dir.path());
        save(&store, "ClusterHosts", &["34.9.9.1"]).unwrap();
        save(&store, "KeyPair", "kept").unwrap();

        clear(&store, &["ClusterHosts", "BastionHost"]).unwrap();

        assert!(store.load_raw("ClusterHosts").unwrap().is_none());
        assert!(!dir.path().join("ClusterHosts.json").exists());
        assert_eq!(load::<String>(&store, "KeyPair").unwrap(), "kept");

        let memory = MemoryStageStore::new();
        save(&memory, "ImageEnterpriseVault", "img-old").unwrap();
        clear(&memory, &["ImageEnterpriseVault"]).unwrap();
        assert!(memory.load_raw("ImageEnterpriseVault").unwrap().is_none());
    }

    #[test]
    fn test_missing_value() {
        let store = MemoryStageStore::new();
        assert!(matches!(
            load::<String>(&store, "ImageEnterpriseVault"),
            Err(HarnessError::Stage(ref m)) if m.contains("ImageEnterpriseVault")
        ));
    }

    #[tokio::test]
    #[serial]
    async fn test_skip_from_environment() {
        let ran = AtomicBool::new(false);

        std::env::set_var("SKIP_deploy", "true");
        run_stage("deploy", || async {
            ran.store(true, Ordering::SeqCst);
            Ok::<_, HarnessError>(())
        })
        .await
        .unwrap();
        std::env::remove_var("SKIP_deploy");
        assert!(!ran.load(Ordering::SeqCst));

        run_stage("deploy", || async {
            ran.store(true, Ordering::SeqCst);
            Ok::<_, HarnessError>(())
        })
        .await
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
