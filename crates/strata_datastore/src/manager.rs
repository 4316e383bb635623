//! File lifecycle between a task directory and the datastore.
//!
//! Discovery lists a directory (shallow for task and working directories,
//! recursive for the datastore), matches each entry against the selected
//! categories, and, for datastore inputs of a task with reprocessing
//! settings, drops files the lineage ledger says were already handled.
//! Transfers translate names through the category, create parents, run the
//! configured [`TransferStrategy`], and record provenance.

use crate::category::FileCategory;
use crate::config::{DatastoreConfig, ReprocessingConfig, ReprocessingMode};
use crate::copy::{prepare_tree_for_overwrite, CopyMode, TransferStrategy};
use crate::error::{DatastoreError, Result};
use crate::lineage::{datastore_name, DataFileType, LineageStore};
use crate::models::ModelRegistry;
use crate::subtask::{AlgorithmStateFiles, TaskConfiguration};
use crate::tasks::PipelineTasks;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_ids::{NodeId, TaskId};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Matched paths keyed by category name.
pub type CategoryFiles = BTreeMap<String, BTreeSet<PathBuf>>;

/// Which naming convention a directory uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Flat directory; entries are matched by file name.
    WorkingDir,
    /// Nested datastore tree; entries are matched by datastore-relative path.
    Datastore,
}

/// Source and destination of one transfer, plus its datastore side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPaths {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Datastore-relative path of whichever end lives in the datastore.
    pub datastore_path: PathBuf,
}

impl TransferPaths {
    /// Datastore file `file` (datastore-relative) staged into `task_dir`.
    pub fn to_task_dir(
        datastore_root: &Path,
        task_dir: &Path,
        category: &FileCategory,
        file: &Path,
    ) -> Result<Self> {
        let name = datastore_name(file);
        let task_dir_name = category.to_working_dir_name(&name).ok_or_else(|| {
            DatastoreError::InvalidState(format!(
                "{} does not match category {}",
                name,
                category.name()
            ))
        })?;
        Ok(Self {
            source: datastore_root.join(file),
            destination: task_dir.join(task_dir_name),
            datastore_path: file.to_path_buf(),
        })
    }

    /// Task directory file `file` committed into the datastore.
    pub fn to_datastore(
        datastore_root: &Path,
        task_dir: &Path,
        category: &FileCategory,
        file: &Path,
    ) -> Result<Self> {
        let name = file.to_string_lossy();
        let datastore_file = category.to_datastore_name(&name).ok_or_else(|| {
            DatastoreError::InvalidState(format!(
                "{} does not match category {}",
                name,
                category.name()
            ))
        })?;
        Ok(Self {
            source: task_dir.join(file),
            destination: datastore_root.join(&datastore_file),
            datastore_path: PathBuf::from(datastore_file),
        })
    }
}

/// The pipeline task a manager works on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub node_id: NodeId,
    /// Absent settings disable reprocessing filters entirely.
    pub reprocessing: Option<ReprocessingConfig>,
}

impl TaskContext {
    pub fn new(task_id: TaskId, node_id: NodeId) -> Self {
        Self {
            task_id,
            node_id,
            reprocessing: None,
        }
    }

    pub fn with_reprocessing(mut self, reprocessing: ReprocessingConfig) -> Self {
        self.reprocessing = Some(reprocessing);
        self
    }
}

/// Discovers, transfers and deletes category files for one task directory.
pub struct FileLifecycleManager {
    datastore_root: PathBuf,
    task_dir: PathBuf,
    task: Option<TaskContext>,
    lineage: LineageStore,
    tasks: Arc<dyn PipelineTasks>,
    task_dir_strategy: Box<dyn TransferStrategy>,
    datastore_strategy: Box<dyn TransferStrategy>,
}

impl std::fmt::Debug for FileLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLifecycleManager")
            .field("datastore_root", &self.datastore_root)
            .field("task_dir", &self.task_dir)
            .field("task", &self.task)
            .field("task_dir_mode", &self.task_dir_strategy.mode())
            .field("datastore_mode", &self.datastore_strategy.mode())
            .finish()
    }
}

impl FileLifecycleManager {
    /// A relative `datastore_root` is resolved against the current directory
    /// so symlinks staged into task directories stay valid.
    pub fn new(
        datastore_root: impl Into<PathBuf>,
        task_dir: impl Into<PathBuf>,
        lineage: LineageStore,
        tasks: Arc<dyn PipelineTasks>,
    ) -> Result<Self> {
        let datastore_root = absolute_path(datastore_root.into())?;
        Ok(Self {
            task_dir_strategy: CopyMode::Copy.strategy(&datastore_root),
            datastore_strategy: CopyMode::Move.strategy(&datastore_root),
            datastore_root,
            task_dir: task_dir.into(),
            task: None,
            lineage,
            tasks,
        })
    }

    pub fn from_config(
        config: &DatastoreConfig,
        task_dir: impl Into<PathBuf>,
        lineage: LineageStore,
        tasks: Arc<dyn PipelineTasks>,
    ) -> Result<Self> {
        Ok(Self::new(config.datastore_root.clone(), task_dir, lineage, tasks)?
            .use_symlinks(config.use_symlinks))
    }

    pub fn with_task(mut self, task: TaskContext) -> Self {
        self.task = Some(task);
        self
    }

    /// Stage into task directories as symlinks instead of copies.
    pub fn use_symlinks(mut self, enabled: bool) -> Self {
        let mode = if enabled {
            CopyMode::Symlink
        } else {
            CopyMode::Copy
        };
        self.task_dir_strategy = mode.strategy(&self.datastore_root);
        self
    }

    pub fn datastore_root(&self) -> &Path {
        &self.datastore_root
    }

    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    pub fn task(&self) -> Option<&TaskContext> {
        self.task.as_ref()
    }

    pub fn lineage(&self) -> &LineageStore {
        &self.lineage
    }

    pub fn task_dir_copy_mode(&self) -> CopyMode {
        self.task_dir_strategy.mode()
    }

    fn require_task(&self, operation: &str) -> Result<&TaskContext> {
        self.task.as_ref().ok_or_else(|| {
            DatastoreError::InvalidState(format!("{} requires a pipeline task", operation))
        })
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Category files in the task directory, by file name.
    pub fn working_dir_files(&self, categories: &[&FileCategory]) -> Result<CategoryFiles> {
        Ok(into_category_files(self.discover(
            &[self.task_dir.clone()],
            categories,
            SearchScope::WorkingDir,
        )?))
    }

    /// Category files under `subdir` of the datastore, by datastore-relative
    /// path, after reprocessing filters.
    pub fn datastore_files(
        &self,
        subdir: &Path,
        categories: &[&FileCategory],
    ) -> Result<CategoryFiles> {
        Ok(into_category_files(self.discover(
            &[self.datastore_root.join(subdir)],
            categories,
            SearchScope::Datastore,
        )?))
    }

    pub fn count_datastore_files_of_category(
        &self,
        category: &FileCategory,
        subdir: &Path,
    ) -> Result<usize> {
        Ok(self
            .datastore_files(subdir, &[category])?
            .values()
            .map(BTreeSet::len)
            .sum())
    }

    /// Every datastore file under `subdir` the task should take as input.
    pub fn datastore_files_for_inputs(
        &self,
        subdir: &Path,
        categories: &[&FileCategory],
    ) -> Result<BTreeSet<PathBuf>> {
        Ok(self
            .datastore_files(subdir, categories)?
            .into_values()
            .flatten()
            .collect())
    }

    fn discover<'c>(
        &self,
        dirs: &[PathBuf],
        categories: &[&'c FileCategory],
        scope: SearchScope,
    ) -> Result<Vec<(&'c FileCategory, BTreeSet<PathBuf>)>> {
        let mut found: Vec<(&FileCategory, BTreeSet<PathBuf>)> =
            categories.iter().map(|c| (*c, BTreeSet::new())).collect();

        for dir in dirs {
            let candidates = match scope {
                SearchScope::WorkingDir => list_shallow(dir)?,
                SearchScope::Datastore => self.list_recursive(dir)?,
            };
            for (category, matches) in found.iter_mut() {
                let of_category: BTreeSet<PathBuf> = candidates
                    .iter()
                    .filter(|path| {
                        let name = datastore_name(path);
                        match scope {
                            SearchScope::WorkingDir => category.matches_working_dir_name(&name),
                            SearchScope::Datastore => category.matches_datastore_name(&name),
                        }
                    })
                    .cloned()
                    .collect();
                let kept = match scope {
                    SearchScope::WorkingDir => of_category,
                    SearchScope::Datastore => self.filter_for_reprocessing(of_category)?,
                };
                debug!(
                    dir = %dir.display(),
                    category = %category.name(),
                    files = kept.len(),
                    "Discovered category files"
                );
                matches.extend(kept);
            }
        }
        Ok(found)
    }

    /// Entries under `dir`, relative to the datastore root.
    fn list_recursive(&self, dir: &Path) -> Result<BTreeSet<PathBuf>> {
        let mut entries = BTreeSet::new();
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry?;
            if let Ok(relative) = entry.path().strip_prefix(&self.datastore_root) {
                if !relative.as_os_str().is_empty() {
                    entries.insert(relative.to_path_buf());
                }
            }
        }
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Reprocessing filters
    // ------------------------------------------------------------------

    fn filter_for_reprocessing(&self, candidates: BTreeSet<PathBuf>) -> Result<BTreeSet<PathBuf>> {
        let Some(task) = self.task.as_ref() else {
            return Ok(candidates);
        };
        let Some(reprocessing) = task.reprocessing.as_ref() else {
            return Ok(candidates);
        };
        if candidates.is_empty() {
            return Ok(candidates);
        }
        match reprocessing.mode() {
            ReprocessingMode::Full => Ok(candidates),
            ReprocessingMode::KeepUp => self.filter_for_keep_up(task, candidates),
            ReprocessingMode::Bugfix(excluded) => self.filter_for_bugfix(task, candidates, &excluded),
        }
    }

    /// Drop files any task on this node already consumed, with or without output.
    fn filter_for_keep_up(
        &self,
        task: &TaskContext,
        candidates: BTreeSet<PathBuf>,
    ) -> Result<BTreeSet<PathBuf>> {
        let records = self.lineage.retrieve_by_filename(&candidates)?;
        let all_consumers: BTreeSet<TaskId> =
            records.iter().flat_map(|r| r.all_consumers()).collect();
        let same_node = self.tasks.ids_for_node(&all_consumers, task.node_id)?;

        let handled: BTreeSet<String> = records
            .into_iter()
            .filter(|r| !r.all_consumers().is_disjoint(&same_node))
            .map(|r| r.filename)
            .collect();
        let kept = retain_unhandled(candidates, &handled);
        info!(
            task_id = %task.task_id,
            skipped = handled.len(),
            kept = kept.len(),
            "Applied keep-up filter"
        );
        Ok(kept)
    }

    /// Keep files none of the excluded same-node tasks successfully consumed.
    fn filter_for_bugfix(
        &self,
        task: &TaskContext,
        candidates: BTreeSet<PathBuf>,
        excluded: &BTreeSet<TaskId>,
    ) -> Result<BTreeSet<PathBuf>> {
        let same_node = self.tasks.ids_for_node(excluded, task.node_id)?;
        if same_node.is_empty() {
            debug!(task_id = %task.task_id, "No excluded task shares this node");
            return Ok(candidates);
        }
        let records = self.lineage.retrieve_by_filename(&candidates)?;
        let handled: BTreeSet<String> = records
            .into_iter()
            .filter(|r| !r.consumers().is_disjoint(&same_node))
            .map(|r| r.filename)
            .collect();
        let kept = retain_unhandled(candidates, &handled);
        info!(
            task_id = %task.task_id,
            skipped = handled.len(),
            kept = kept.len(),
            "Applied bugfix filter"
        );
        Ok(kept)
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Stage datastore inputs under `subdir` into the task directory and make
    /// their producers the task's producer set. Returns the staged
    /// datastore-relative paths.
    pub fn copy_datastore_files_to_task_dir(
        &self,
        subdir: &Path,
        categories: &[&FileCategory],
    ) -> Result<CategoryFiles> {
        let task = self.require_task("staging datastore files")?;
        let found = self.discover(
            &[self.datastore_root.join(subdir)],
            categories,
            SearchScope::Datastore,
        )?;

        let mut staged = BTreeSet::new();
        for (category, files) in &found {
            for file in files {
                let paths =
                    TransferPaths::to_task_dir(&self.datastore_root, &self.task_dir, category, file)?;
                self.task_dir_strategy
                    .transfer(&paths.source, &paths.destination)?;
                staged.insert(paths.datastore_path);
            }
        }

        let producers = self.lineage.retrieve_producers(&staged)?;
        self.tasks
            .replace_producer_task_ids(task.task_id, &producers)?;
        info!(
            task_id = %task.task_id,
            files = staged.len(),
            producers = producers.len(),
            mode = %self.task_dir_strategy.mode(),
            "Staged datastore files into task directory"
        );
        Ok(into_category_files(found))
    }

    /// Move category files from the task directory into the datastore and
    /// record the task as their producer. Returns datastore-relative paths.
    ///
    /// Files moved before a failure keep their provenance; the error is
    /// returned afterwards.
    pub fn move_task_dir_files_to_datastore(
        &self,
        categories: &[&FileCategory],
    ) -> Result<CategoryFiles> {
        let task = self.require_task("committing task files")?;
        let found = self.discover(&[self.task_dir.clone()], categories, SearchScope::WorkingDir)?;

        let mut moved = CategoryFiles::new();
        let mut all_moved = BTreeSet::new();
        let mut failure = None;
        'outer: for (category, files) in &found {
            let entry = moved.entry(category.name().to_string()).or_default();
            for file in files {
                match self.commit_one(category, file) {
                    Ok(datastore_path) => {
                        entry.insert(datastore_path.clone());
                        all_moved.insert(datastore_path);
                    }
                    Err(err) => {
                        failure = Some(err);
                        break 'outer;
                    }
                }
            }
        }

        self.lineage
            .create_or_update_producer(task.task_id, &all_moved, DataFileType::Data)?;
        if let Some(err) = failure {
            warn!(
                task_id = %task.task_id,
                moved = all_moved.len(),
                error = %err,
                "Commit to datastore stopped early"
            );
            return Err(err);
        }
        info!(task_id = %task.task_id, files = all_moved.len(), "Moved task files to datastore");
        Ok(moved)
    }

    fn commit_one(&self, category: &FileCategory, file: &Path) -> Result<PathBuf> {
        let paths = TransferPaths::to_datastore(&self.datastore_root, &self.task_dir, category, file)?;
        if let Some(parent) = paths.destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DatastoreError::io("create directory", parent, e))?;
        }
        self.datastore_strategy
            .transfer(&paths.source, &paths.destination)?;
        Ok(paths.datastore_path)
    }

    /// Delete category files from the task directory.
    pub fn delete_task_dir_files(&self, categories: &[&FileCategory]) -> Result<usize> {
        let found = self.discover(&[self.task_dir.clone()], categories, SearchScope::WorkingDir)?;
        let mut deleted = 0;
        for (_, files) in &found {
            for file in files {
                delete_path(&self.task_dir.join(file))?;
                deleted += 1;
            }
        }
        debug!(task_dir = %self.task_dir.display(), files = deleted, "Deleted task directory files");
        Ok(deleted)
    }

    /// Copy category files from `working_dir` into the task directory under
    /// the same names.
    pub fn copy_files_from_working_dir_to_task_dir(
        &self,
        working_dir: &Path,
        categories: &[&FileCategory],
    ) -> Result<usize> {
        let found = self.discover(&[working_dir.to_path_buf()], categories, SearchScope::WorkingDir)?;
        let mut copied = 0;
        for (_, files) in &found {
            for file in files {
                self.task_dir_strategy
                    .transfer(&working_dir.join(file), &self.task_dir.join(file))?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    pub fn working_dir_has_files_of_categories(
        &self,
        working_dir: &Path,
        categories: &[&FileCategory],
    ) -> Result<bool> {
        Ok(self
            .discover(&[working_dir.to_path_buf()], categories, SearchScope::WorkingDir)?
            .iter()
            .any(|(_, files)| !files.is_empty()))
    }

    pub fn copy_files_by_name_from_task_dir_to_working_dir<I, S>(
        &self,
        working_dir: &Path,
        names: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let name = name.as_ref();
            self.task_dir_strategy
                .transfer(&self.task_dir.join(name), &working_dir.join(name))?;
        }
        Ok(())
    }

    /// Stage the current model of each type under its original file name.
    /// Returns the staged file names.
    pub fn copy_model_files_to_task_dir<I, S>(
        &self,
        registry: &ModelRegistry,
        model_types: I,
    ) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut staged = Vec::new();
        for model_type in model_types {
            let model_type = model_type.as_ref();
            let source = self.datastore_root.join(registry.datastore_path(model_type)?);
            let original = registry
                .get(model_type)
                .map(|m| m.original_file_name.clone())
                .ok_or_else(|| {
                    DatastoreError::Model(format!("no model of type '{}' in registry", model_type))
                })?;
            info!(model_type, file = %original, "Copying model file to task directory");
            self.task_dir_strategy
                .transfer(&source, &self.task_dir.join(&original))?;
            staged.push(original);
        }
        Ok(staged)
    }

    // ------------------------------------------------------------------
    // Completed subtasks
    // ------------------------------------------------------------------

    /// Datastore names of category files in completed subtasks that set
    /// their results flag.
    pub fn datastore_files_in_completed_subtasks_with_results(
        &self,
        categories: &[&FileCategory],
    ) -> Result<BTreeSet<String>> {
        self.datastore_files_in_completed_subtasks(categories, true)
    }

    /// Datastore names of category files in completed subtasks that
    /// produced no results.
    pub fn datastore_files_in_completed_subtasks_without_results(
        &self,
        categories: &[&FileCategory],
    ) -> Result<BTreeSet<String>> {
        self.datastore_files_in_completed_subtasks(categories, false)
    }

    fn datastore_files_in_completed_subtasks(
        &self,
        categories: &[&FileCategory],
        with_results: bool,
    ) -> Result<BTreeSet<String>> {
        let config = TaskConfiguration::restore(&self.task_dir)?;
        let subtask_dirs: Vec<PathBuf> = config
            .all_subtask_directories()
            .into_iter()
            .filter(|dir| {
                let state = AlgorithmStateFiles::new(dir);
                state.is_complete() && state.has_results() == with_results
            })
            .collect();

        let found = self.discover(&subtask_dirs, categories, SearchScope::WorkingDir)?;
        let mut names = BTreeSet::new();
        for (category, files) in &found {
            for file in files {
                let file_name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if let Some(name) = category.to_datastore_name(&file_name) {
                    names.insert(name);
                }
            }
        }
        debug!(
            subtasks = subtask_dirs.len(),
            files = names.len(),
            with_results,
            "Collected completed subtask files"
        );
        Ok(names)
    }
}

fn absolute_path(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir()
        .map_err(|e| DatastoreError::io("resolve current directory for", &path, e))?;
    Ok(cwd.join(path))
}

fn into_category_files(found: Vec<(&FileCategory, BTreeSet<PathBuf>)>) -> CategoryFiles {
    let mut map = CategoryFiles::new();
    for (category, files) in found {
        map.entry(category.name().to_string())
            .or_default()
            .extend(files);
    }
    map
}

fn retain_unhandled(candidates: BTreeSet<PathBuf>, handled: &BTreeSet<String>) -> BTreeSet<PathBuf> {
    candidates
        .into_iter()
        .filter(|path| !handled.contains(&datastore_name(path)))
        .collect()
}

/// Entry names directly inside `dir`.
fn list_shallow(dir: &Path) -> Result<BTreeSet<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| DatastoreError::io("list files in", dir, e))?;
    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|e| DatastoreError::io("list files in", dir, e))?;
        names.insert(PathBuf::from(entry.file_name()));
    }
    Ok(names)
}

/// Remove a symlink, file or directory tree according to what is on disk.
fn delete_path(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path).map_err(|e| DatastoreError::io("stat", path, e))?;
    let file_type = metadata.file_type();
    let result = if file_type.is_symlink() || file_type.is_file() {
        fs::remove_file(path)
    } else {
        prepare_tree_for_overwrite(path).and_then(|_| fs::remove_dir_all(path))
    };
    result.map_err(|e| DatastoreError::io("delete", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::SqlPipelineTasks;
    use strata_db::DbConnection;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        datastore: PathBuf,
        task_dir: PathBuf,
        lineage: LineageStore,
        tasks: Arc<SqlPipelineTasks>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let datastore = temp.path().join("datastore");
            let task_dir = temp.path().join("task");
            fs::create_dir_all(&datastore).unwrap();
            fs::create_dir_all(&task_dir).unwrap();
            let conn = DbConnection::open_sqlite_memory().unwrap();
            Self {
                temp,
                datastore,
                task_dir,
                lineage: LineageStore::open(conn.clone()).unwrap(),
                tasks: Arc::new(SqlPipelineTasks::open(conn).unwrap()),
            }
        }

        fn manager(&self) -> FileLifecycleManager {
            FileLifecycleManager::new(
                &self.datastore,
                &self.task_dir,
                self.lineage.clone(),
                self.tasks.clone(),
            )
            .unwrap()
        }
    }

    fn flat_category() -> FileCategory {
        FileCategory::new("raw", r"raw-([0-9]+)\.dat", "raw/$1/raw-$1.dat").unwrap()
    }

    #[test]
    fn shallow_discovery_ignores_nested_entries() {
        let fx = Fixture::new();
        fs::write(fx.task_dir.join("raw-1.dat"), b"1").unwrap();
        fs::write(fx.task_dir.join("notes.txt"), b"").unwrap();
        fs::create_dir_all(fx.task_dir.join("sub")).unwrap();
        fs::write(fx.task_dir.join("sub/raw-2.dat"), b"2").unwrap();

        let category = flat_category();
        let files = fx.manager().working_dir_files(&[&category]).unwrap();
        assert_eq!(files["raw"], BTreeSet::from([PathBuf::from("raw-1.dat")]));
    }

    #[test]
    fn missing_directory_names_path() {
        let fx = Fixture::new();
        let category = flat_category();
        let err = fx
            .manager()
            .copy_files_from_working_dir_to_task_dir(&fx.task_dir.join("absent"), &[&category])
            .unwrap_err();
        assert!(err.to_string().contains("absent"));
    }

    #[test]
    fn staging_requires_task() {
        let fx = Fixture::new();
        let category = flat_category();
        assert!(matches!(
            fx.manager()
                .copy_datastore_files_to_task_dir(Path::new(""), &[&category]),
            Err(DatastoreError::InvalidState(_))
        ));
    }

    #[test]
    fn delete_dispatches_on_file_type() {
        let fx = Fixture::new();
        fs::write(fx.task_dir.join("raw-1.dat"), b"1").unwrap();
        fs::create_dir_all(fx.task_dir.join("raw-2.dat/inner")).unwrap();
        fs::write(fx.task_dir.join("raw-2.dat/inner/x"), b"x").unwrap();

        let category = flat_category();
        let deleted = fx.manager().delete_task_dir_files(&[&category]).unwrap();
        assert_eq!(deleted, 2);
        assert!(!fx.task_dir.join("raw-1.dat").exists());
        assert!(!fx.task_dir.join("raw-2.dat").exists());
    }

    #[cfg(unix)]
    #[test]
    fn delete_unlinks_symlink_without_touching_target() {
        let fx = Fixture::new();
        let target = fx.datastore.join("target.dat");
        fs::write(&target, b"t").unwrap();
        std::os::unix::fs::symlink(&target, fx.task_dir.join("raw-3.dat")).unwrap();

        let category = flat_category();
        fx.manager().delete_task_dir_files(&[&category]).unwrap();
        assert!(fs::symlink_metadata(fx.task_dir.join("raw-3.dat")).is_err());
        assert!(target.exists());
    }

    #[test]
    fn working_dir_copies_keep_names() {
        let fx = Fixture::new();
        let working = fx.temp.path().join("working");
        fs::create_dir_all(&working).unwrap();
        fs::write(working.join("raw-9.dat"), b"9").unwrap();

        let category = flat_category();
        let manager = fx.manager();
        assert!(manager
            .working_dir_has_files_of_categories(&working, &[&category])
            .unwrap());
        assert_eq!(
            manager
                .copy_files_from_working_dir_to_task_dir(&working, &[&category])
                .unwrap(),
            1
        );
        assert_eq!(fs::read(fx.task_dir.join("raw-9.dat")).unwrap(), b"9");

        let back = fx.temp.path().join("back");
        fs::create_dir_all(&back).unwrap();
        manager
            .copy_files_by_name_from_task_dir_to_working_dir(&back, ["raw-9.dat"])
            .unwrap();
        assert!(back.join("raw-9.dat").is_file());
    }

    #[test]
    fn symlink_mode_is_selected_by_config() {
        let fx = Fixture::new();
        let config = DatastoreConfig {
            datastore_root: fx.datastore.clone(),
            use_symlinks: true,
            ..DatastoreConfig::default()
        };
        let manager =
            FileLifecycleManager::from_config(&config, &fx.task_dir, fx.lineage.clone(), fx.tasks.clone())
                .unwrap();
        assert_eq!(manager.task_dir_copy_mode(), CopyMode::Symlink);
        assert_eq!(fx.manager().task_dir_copy_mode(), CopyMode::Copy);
    }

    #[test]
    fn relative_datastore_root_is_made_absolute() {
        let fx = Fixture::new();
        let manager = FileLifecycleManager::new(
            "relative-datastore",
            &fx.task_dir,
            fx.lineage.clone(),
            fx.tasks.clone(),
        )
        .unwrap();
        assert!(manager.datastore_root().is_absolute());
        assert_eq!(
            manager.datastore_root(),
            std::env::current_dir().unwrap().join("relative-datastore")
        );
        assert_eq!(fx.manager().datastore_root(), fx.datastore.as_path());
    }

    #[test]
    fn transfer_paths_translate_names() {
        let category = flat_category();
        let commit = TransferPaths::to_datastore(
            Path::new("/ds"),
            Path::new("/task"),
            &category,
            Path::new("raw-7.dat"),
        )
        .unwrap();
        assert_eq!(commit.destination, PathBuf::from("/ds/raw/7/raw-7.dat"));
        assert_eq!(commit.datastore_path, PathBuf::from("raw/7/raw-7.dat"));

        let stage = TransferPaths::to_task_dir(
            Path::new("/ds"),
            Path::new("/task"),
            &category,
            Path::new("raw/7/raw-7.dat"),
        )
        .unwrap();
        assert_eq!(stage.source, PathBuf::from("/ds/raw/7/raw-7.dat"));
        assert_eq!(stage.destination, PathBuf::from("/task/raw-7.dat"));

        assert!(TransferPaths::to_datastore(
            Path::new("/ds"),
            Path::new("/task"),
            &category,
            Path::new("other.dat"),
        )
        .is_err());
    }
}
