//! Datastore configuration, file category registry and per-task
//! reprocessing settings.

use crate::category::FileCategory;
use crate::error::{DatastoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use strata_ids::TaskId;
use tracing::info;

/// Main configuration for the datastore layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastoreConfig {
    /// Root of the canonical datastore tree
    pub datastore_root: PathBuf,

    /// Path to the SQLite lineage database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Stage datastore files into task directories as symlinks instead of copies
    #[serde(default)]
    pub use_symlinks: bool,

    /// File categories known to the pipeline
    #[serde(default)]
    pub categories: Vec<FileCategoryDef>,
}

/// Uncompiled file category as written in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCategoryDef {
    pub name: String,
    pub working_dir_regex: String,
    pub datastore_template: String,
}

impl FileCategoryDef {
    pub fn compile(&self) -> Result<FileCategory> {
        FileCategory::new(&self.name, &self.working_dir_regex, &self.datastore_template)
    }
}

/// Strata home directory: `$STRATA_HOME`, else `~/.strata`.
pub fn strata_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("STRATA_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .map(|home| home.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}

fn default_database_path() -> PathBuf {
    strata_home().join("strata.sqlite3")
}

fn default_datastore_root() -> PathBuf {
    strata_home().join("datastore")
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            datastore_root: default_datastore_root(),
            database_path: default_database_path(),
            use_symlinks: false,
            categories: Vec::new(),
        }
    }
}

impl DatastoreConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DatastoreError::io("read", path, e))?;
        toml::from_str(&content).map_err(|e| DatastoreError::Toml(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| DatastoreError::Toml(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| DatastoreError::io("write", path, e))?;
        Ok(())
    }

    /// Compile and validate every category. Fails on the first invalid one.
    pub fn registry(&self) -> Result<CategoryRegistry> {
        let registry = CategoryRegistry::from_categories(
            self.categories
                .iter()
                .map(FileCategoryDef::compile)
                .collect::<Result<Vec<_>>>()?,
        )?;
        info!(categories = registry.len(), "Loaded file categories");
        Ok(registry)
    }
}

/// Compiled categories keyed by name.
#[derive(Debug, Clone, Default)]
pub struct CategoryRegistry {
    categories: BTreeMap<String, FileCategory>,
}

impl CategoryRegistry {
    pub fn from_categories(categories: impl IntoIterator<Item = FileCategory>) -> Result<Self> {
        let mut registry = Self::default();
        for category in categories {
            registry.insert(category)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, category: FileCategory) -> Result<()> {
        let name = category.name().to_string();
        if self.categories.contains_key(&name) {
            return Err(DatastoreError::config(name, "defined more than once"));
        }
        self.categories.insert(name, category);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FileCategory> {
        self.categories.get(name)
    }

    /// Look up each name; an unknown name is an error.
    pub fn select<'a, I, S>(&'a self, names: I) -> Result<Vec<&'a FileCategory>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                self.get(name)
                    .ok_or_else(|| DatastoreError::UnknownCategory(name.to_string()))
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileCategory> {
        self.categories.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Per-task reprocessing settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReprocessingConfig {
    /// Reprocess everything instead of only files this step has not handled
    #[serde(default)]
    pub reprocess: bool,

    /// Prior tasks whose inputs should be reprocessed
    #[serde(default)]
    pub exclude_task_ids: Vec<TaskId>,
}

/// How candidate datastore inputs are filtered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReprocessingMode {
    /// No filtering.
    Full,
    /// Skip files any task on the same node already consumed.
    KeepUp,
    /// Reprocess only files not successfully consumed by these tasks.
    Bugfix(BTreeSet<TaskId>),
}

impl ReprocessingConfig {
    pub fn keep_up() -> Self {
        Self::default()
    }

    pub fn full() -> Self {
        Self {
            reprocess: true,
            exclude_task_ids: Vec::new(),
        }
    }

    pub fn bugfix(excluded: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            reprocess: true,
            exclude_task_ids: excluded.into_iter().collect(),
        }
    }

    pub fn mode(&self) -> ReprocessingMode {
        if !self.reprocess {
            ReprocessingMode::KeepUp
        } else if self.exclude_task_ids.is_empty() {
            ReprocessingMode::Full
        } else {
            ReprocessingMode::Bugfix(self.exclude_task_ids.iter().copied().collect())
        }
    }
}
