//! Persistence of the currently used bridge configuration.
//!
//! The embedding application owns where and how settings live. The manager
//! only reads the stored configuration once, when it is constructed.

use crate::bridges::BridgeConfiguration;
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Storage for the bridge configuration in use.
pub trait BridgeSettingsStore: Send + Sync {
    /// Load the stored configuration, or the default when nothing is stored.
    fn load(&self) -> Result<BridgeConfiguration>;

    /// Persist `configuration`.
    fn save(&self, configuration: &BridgeConfiguration) -> Result<()>;
}

/// JSON file backed settings.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    /// Store at `path`. The file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the settings file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BridgeSettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<BridgeConfiguration> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BridgeConfiguration::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, configuration: &BridgeConfiguration) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(configuration)?;
        // Atomic replace.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory settings.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    inner: Mutex<BridgeConfiguration>,
}

impl MemorySettingsStore {
    /// Store pre-loaded with `configuration`.
    pub fn new(configuration: BridgeConfiguration) -> Self {
        Self {
            inner: Mutex::new(configuration),
        }
    }
}

impl BridgeSettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<BridgeConfiguration> {
        Ok(self
            .inner
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone()))
    }

    fn save(&self, configuration: &BridgeConfiguration) -> Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = configuration.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::BridgesType;
    use crate::error::Error;

    #[test]
    fn test_json_store_missing_file_is_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonSettingsStore::new(dir.path().join("bridges.json"));
        assert_eq!(store.load().expect("load"), BridgeConfiguration::default());
    }

    #[test]
    fn test_json_store_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonSettingsStore::new(dir.path().join("nested").join("bridges.json"));
        let config = BridgeConfiguration::new(
            BridgesType::Custom,
            Some(vec!["obfs4 192.0.2.1:443 FP cert=abc".into()]),
        );
        store.save(&config).expect("save");
        assert_eq!(store.load().expect("load"), config);
    }

    #[test]
    fn test_json_store_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bridges.json");
        std::fs::write(&path, b"{not json").expect("write");
        let store = JsonSettingsStore::new(path);
        assert!(matches!(store.load(), Err(Error::Settings(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySettingsStore::default();
        let config = BridgeConfiguration::new(BridgesType::BuiltIn, None);
        store.save(&config).expect("save");
        assert_eq!(store.load().expect("load"), config);
    }
}
