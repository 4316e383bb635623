//! Model registry view and the single-writer lock around registry updates.
//!
//! Importing models and rewriting the registry must happen as one critical
//! section across every task running the import step, in this process and
//! in others sharing the datastore.

use crate::error::{DatastoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use strata_db::lock_exclusive;
use tracing::{debug, info};

/// Datastore directory holding model files, one subdirectory per model type.
pub const MODELS_DIR: &str = "models";

/// Where a model of one type lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// File name the algorithm expects in its task directory
    pub original_file_name: String,

    /// File name under `models/<type>/` in the datastore
    #[serde(default)]
    pub datastore_file_name: Option<String>,
}

impl ModelMetadata {
    pub fn new(original_file_name: impl Into<String>, datastore_file_name: impl Into<String>) -> Self {
        Self {
            original_file_name: original_file_name.into(),
            datastore_file_name: Some(datastore_file_name.into()),
        }
    }
}

/// Current model of each type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRegistry {
    #[serde(default)]
    pub models: BTreeMap<String, ModelMetadata>,
}

impl ModelRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| DatastoreError::io("read", path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DatastoreError::io("create directory", parent, e))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| DatastoreError::io("write", path, e))
    }

    pub fn get(&self, model_type: &str) -> Option<&ModelMetadata> {
        self.models.get(model_type)
    }

    pub fn insert(&mut self, model_type: impl Into<String>, metadata: ModelMetadata) {
        self.models.insert(model_type.into(), metadata);
    }

    /// Datastore-relative path of the current model of `model_type`.
    pub fn datastore_path(&self, model_type: &str) -> Result<PathBuf> {
        let metadata = self.get(model_type).ok_or_else(|| {
            DatastoreError::Model(format!("no model of type '{}' in registry", model_type))
        })?;
        let file_name = metadata.datastore_file_name.as_deref().ok_or_else(|| {
            DatastoreError::Model(format!(
                "model '{}' of type '{}' has no datastore file name",
                metadata.original_file_name, model_type
            ))
        })?;
        Ok(Path::new(MODELS_DIR).join(model_type).join(file_name))
    }
}

/// Serializes registry updates within this process and across processes.
#[derive(Debug)]
pub struct ModelRegistryLock {
    registry_path: PathBuf,
    in_process: Mutex<()>,
}

impl ModelRegistryLock {
    pub fn new(registry_path: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            in_process: Mutex::new(()),
        }
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// Run `op` while holding both the in-process mutex and the exclusive
    /// file lock beside the registry.
    pub fn with_exclusive<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let _local = self
            .in_process
            .lock()
            .map_err(|_| DatastoreError::InvalidState("model registry mutex poisoned".to_string()))?;
        let guard = lock_exclusive(&self.registry_path)?;
        debug!(lock = %guard.lock_path().display(), "Acquired model registry lock");
        op()
    }

    /// Load the registry, apply `op`, and save it, all inside the critical section.
    pub fn update<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut ModelRegistry) -> Result<T>,
    {
        self.with_exclusive(|| {
            let mut registry = ModelRegistry::load(&self.registry_path)?;
            let value = op(&mut registry)?;
            registry.save(&self.registry_path)?;
            info!(
                path = %self.registry_path.display(),
                models = registry.models.len(),
                "Updated model registry"
            );
            Ok(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn datastore_path_requires_metadata() {
        let mut registry = ModelRegistry::default();
        registry.insert("geometry", ModelMetadata::new("geometry.xml", "geometry-v2.xml"));
        registry.insert(
            "focal-plane",
            ModelMetadata {
                original_file_name: "fp.h5".to_string(),
                datastore_file_name: None,
            },
        );

        assert_eq!(
            registry.datastore_path("geometry").unwrap(),
            PathBuf::from("models/geometry/geometry-v2.xml")
        );
        assert!(matches!(registry.datastore_path("focal-plane"), Err(DatastoreError::Model(_))));
        assert!(matches!(registry.datastore_path("read-noise"), Err(DatastoreError::Model(_))));
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        let temp = TempDir::new().unwrap();
        let lock = Arc::new(ModelRegistryLock::new(temp.path().join("registry.json")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    lock.update(|registry| {
                        let count = registry.models.len();
                        registry.insert(
                            format!("type-{}", i),
                            ModelMetadata::new(format!("m{}.xml", i), format!("m{}-{}.xml", i, count)),
                        );
                        Ok(())
                    })
                    .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let registry = ModelRegistry::load(lock.registry_path()).unwrap();
        assert_eq!(registry.models.len(), 8);
    }

    #[test]
    fn failed_update_leaves_registry_unchanged() {
        let temp = TempDir::new().unwrap();
        let lock = ModelRegistryLock::new(temp.path().join("registry.json"));
        lock.update(|registry| {
            registry.insert("geometry", ModelMetadata::new("g.xml", "g-1.xml"));
            Ok(())
        })
        .unwrap();

        let result: Result<()> = lock.update(|registry| {
            registry.insert("noise", ModelMetadata::new("n.xml", "n-1.xml"));
            Err(DatastoreError::Model("import failed".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(ModelRegistry::load(lock.registry_path()).unwrap().models.len(), 1);
    }
}
