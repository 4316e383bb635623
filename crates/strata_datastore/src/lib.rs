//! Datastore layer for Strata.
//!
//! Moves pipeline files between flat task directories and the hierarchical
//! datastore while keeping the lineage ledger consistent:
//!
//! - [`FileCategory`] translates names between the two layouts.
//! - [`CopyMode`] / [`TransferStrategy`] copy, move or symlink with
//!   read-only permissions on everything produced.
//! - [`LineageStore`] records producers and consumers of datastore files and
//!   the failed-import log.
//! - [`FileLifecycleManager`] discovers category files, transfers them,
//!   records provenance, and applies keep-up / bugfix reprocessing filters.
//!
//! # Usage
//!
//! ```rust,ignore
//! use strata_datastore::{DatastoreConfig, FileLifecycleManager, LineageStore, SqlPipelineTasks};
//!
//! let config = DatastoreConfig::load(Path::new("strata.toml"))?;
//! let registry = config.registry()?;
//! let conn = DbConnection::open_sqlite(&config.database_path)?;
//! let manager = FileLifecycleManager::from_config(
//!     &config,
//!     task_dir,
//!     LineageStore::open(conn.clone())?,
//!     Arc::new(SqlPipelineTasks::open(conn)?),
//! )?
//! .with_task(TaskContext::new(task_id, node_id));
//! manager.move_task_dir_files_to_datastore(&registry.select(["calibrated-pixels"])?)?;
//! ```

pub mod category;
pub mod config;
pub mod copy;
pub mod error;
pub mod lineage;
pub mod manager;
pub mod models;
pub mod regex_groups;
pub mod subtask;
pub mod tasks;

pub use category::{derive_datastore_pattern, DatastoreMatcher, DerivedPattern, FileCategory};
pub use config::{
    strata_home, CategoryRegistry, DatastoreConfig, FileCategoryDef, ReprocessingConfig,
    ReprocessingMode,
};
pub use copy::{
    move_or_symlink, resolve_source, CopyMode, CopyTransfer, MoveTransfer, SymlinkTransfer,
    TransferStrategy,
};
pub use error::{DatastoreError, Result};
pub use lineage::{datastore_name, DataFileType, FailedImportRecord, LineageRecord, LineageStore};
pub use manager::{CategoryFiles, FileLifecycleManager, SearchScope, TaskContext, TransferPaths};
pub use models::{ModelMetadata, ModelRegistry, ModelRegistryLock};
pub use subtask::{AlgorithmStateFiles, SubtaskState, TaskConfiguration};
pub use tasks::{PipelineTasks, SqlPipelineTasks};
