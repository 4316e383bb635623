//! Per-task subtask ledger: the persisted task configuration and the
//! zero-length state flag files inside each `st-<index>` directory.

use crate::error::{DatastoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const TASK_CONFIGURATION_FILE: &str = ".task-configuration.json";
pub const SUBTASK_LOCK_FILE: &str = ".lock";
const SUBTASK_DIR_PREFIX: &str = "st-";
const HAS_RESULTS_FLAG: &str = ".HAS_RESULTS";

/// Directory for subtask `index`. Nothing is created.
pub fn subtask_directory(task_dir: &Path, index: usize) -> PathBuf {
    task_dir.join(format!("{}{}", SUBTASK_DIR_PREFIX, index))
}

/// Inputs assigned to each subtask of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfiguration {
    #[serde(skip)]
    task_dir: PathBuf,
    files_for_subtasks: Vec<BTreeSet<String>>,
    subtask_count: usize,
}

impl TaskConfiguration {
    pub fn new(task_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_dir: task_dir.into(),
            files_for_subtasks: Vec::new(),
            subtask_count: 0,
        }
    }

    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    /// Assign `files` to the next subtask, creating its directory and lock file.
    pub fn add_files_for_subtask(&mut self, files: BTreeSet<String>) -> Result<PathBuf> {
        let dir = subtask_directory(&self.task_dir, self.subtask_count);
        fs::create_dir_all(&dir).map_err(|e| DatastoreError::io("create directory", &dir, e))?;
        let lock = dir.join(SUBTASK_LOCK_FILE);
        fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock)
            .map_err(|e| DatastoreError::io("create file", &lock, e))?;
        self.files_for_subtasks.push(files);
        self.subtask_count += 1;
        Ok(dir)
    }

    pub fn subtask_count(&self) -> usize {
        self.subtask_count
    }

    pub fn is_empty(&self) -> bool {
        self.subtask_count == 0
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.subtask_count
    }

    pub fn files_for_subtask(&self, index: usize) -> Option<&BTreeSet<String>> {
        self.files_for_subtasks.get(index)
    }

    /// Subtask directories in index order, creating any that are missing.
    /// Subtask directories of this configuration that exist on disk.
    pub fn all_subtask_directories(&self) -> Vec<PathBuf> {
        (0..self.subtask_count)
            .map(|index| subtask_directory(&self.task_dir, index))
            .filter(|dir| dir.is_dir())
            .collect()
    }

    pub fn persisted_file(task_dir: &Path) -> PathBuf {
        task_dir.join(TASK_CONFIGURATION_FILE)
    }

    pub fn is_persisted(task_dir: &Path) -> bool {
        Self::persisted_file(task_dir).exists()
    }

    /// Write the configuration into its task directory.
    pub fn persist(&self) -> Result<()> {
        let dest = Self::persisted_file(&self.task_dir);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&dest, json).map_err(|e| DatastoreError::io("write", &dest, e))?;
        info!(path = %dest.display(), subtasks = self.subtask_count, "Persisted task configuration");
        Ok(())
    }

    /// Load the configuration persisted in `task_dir`.
    pub fn restore(task_dir: &Path) -> Result<Self> {
        let src = Self::persisted_file(task_dir);
        let content = fs::read_to_string(&src).map_err(|e| DatastoreError::io("read", &src, e))?;
        let mut config: TaskConfiguration = serde_json::from_str(&content)?;
        if config.files_for_subtasks.len() != config.subtask_count {
            return Err(DatastoreError::InvalidState(format!(
                "{} lists {} subtask input sets for {} subtasks",
                src.display(),
                config.files_for_subtasks.len(),
                config.subtask_count
            )));
        }
        config.task_dir = task_dir.to_path_buf();
        debug!(path = %src.display(), subtasks = config.subtask_count, "Restored task configuration");
        Ok(config)
    }
}

/// State recorded by a subtask's flag files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubtaskState {
    /// No flag present.
    Null,
    Processing,
    Complete,
    Failed,
}

impl SubtaskState {
    fn flag_name(&self) -> Option<&'static str> {
        match self {
            SubtaskState::Null => None,
            SubtaskState::Processing => Some(".PROCESSING"),
            SubtaskState::Complete => Some(".COMPLETE"),
            SubtaskState::Failed => Some(".FAILED"),
        }
    }
}

impl fmt::Display for SubtaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubtaskState::Null => "NULL",
            SubtaskState::Processing => "PROCESSING",
            SubtaskState::Complete => "COMPLETE",
            SubtaskState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

const STATE_FLAGS: [SubtaskState; 3] = [
    SubtaskState::Processing,
    SubtaskState::Complete,
    SubtaskState::Failed,
];

/// Flag files in one subtask directory.
#[derive(Debug, Clone)]
pub struct AlgorithmStateFiles {
    dir: PathBuf,
}

impl AlgorithmStateFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn flag_path(&self, state: SubtaskState) -> Option<PathBuf> {
        state.flag_name().map(|name| self.dir.join(name))
    }

    fn results_flag(&self) -> PathBuf {
        self.dir.join(HAS_RESULTS_FLAG)
    }

    /// The current state, or `None` if more than one state flag is present.
    pub fn current_state(&self) -> Option<SubtaskState> {
        let present: Vec<SubtaskState> = STATE_FLAGS
            .iter()
            .copied()
            .filter(|state| self.flag_path(*state).is_some_and(|p| p.is_file()))
            .collect();
        match present.as_slice() {
            [] => Some(SubtaskState::Null),
            [state] => Some(*state),
            _ => {
                warn!(dir = %self.dir.display(), "Duplicate algorithm state files found");
                None
            }
        }
    }

    pub fn state_exists(&self) -> bool {
        !matches!(self.current_state(), Some(SubtaskState::Null))
    }

    pub fn is_processing(&self) -> bool {
        self.current_state() == Some(SubtaskState::Processing)
    }

    pub fn is_complete(&self) -> bool {
        self.current_state() == Some(SubtaskState::Complete)
    }

    pub fn is_failed(&self) -> bool {
        self.current_state() == Some(SubtaskState::Failed)
    }

    pub fn has_results(&self) -> bool {
        self.results_flag().is_file()
    }

    /// Remove every state flag; the results flag is kept.
    pub fn clear_state(&self) -> Result<()> {
        for state in STATE_FLAGS {
            if let Some(path) = self.flag_path(state) {
                remove_flag(&path)?;
            }
        }
        Ok(())
    }

    /// Remove flags left by an interrupted attempt. A completed subtask keeps
    /// its complete and results flags.
    pub fn clear_stale_state(&self) -> Result<()> {
        if !self.is_complete() {
            remove_flag(&self.results_flag())?;
        }
        for state in [SubtaskState::Processing, SubtaskState::Failed] {
            if let Some(path) = self.flag_path(state) {
                remove_flag(&path)?;
            }
        }
        Ok(())
    }

    /// Replace the current state flag with `state`.
    pub fn update_current_state(&self, state: SubtaskState) -> Result<()> {
        let path = self.flag_path(state).ok_or_else(|| {
            DatastoreError::InvalidState(format!("cannot record subtask state {}", state))
        })?;
        self.clear_state()?;
        touch(&path)?;
        debug!(dir = %self.dir.display(), state = %state, "Updated subtask state");
        Ok(())
    }

    pub fn set_results_flag(&self) -> Result<()> {
        touch(&self.results_flag())
    }
}

fn touch(path: &Path) -> Result<()> {
    fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map(|_| ())
        .map_err(|e| DatastoreError::io("create file", path, e))
}

fn remove_flag(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DatastoreError::io("delete", path, e)),
    }
}
