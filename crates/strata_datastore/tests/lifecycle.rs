//! End-to-end file lifecycle tests: commit, stage, reprocessing filters,
//! completed-subtask scans and model staging against a real directory tree.

#![cfg(unix)]

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_datastore::{
    AlgorithmStateFiles, DataFileType, DatastoreError, FileCategory, FileLifecycleManager,
    LineageStore, ModelMetadata, ModelRegistry, PipelineTasks, ReprocessingConfig, SqlPipelineTasks,
    SubtaskState, TaskConfiguration, TaskContext,
};
use strata_db::DbConnection;
use strata_ids::{NodeId, TaskId};
use tempfile::TempDir;

const NODE: NodeId = NodeId::new(100);
const OTHER_NODE: NodeId = NodeId::new(500);

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
        let task_dir = temp.path().join("task-20");
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

    fn manager_in(&self, task_dir: &Path, task: TaskContext) -> FileLifecycleManager {
        FileLifecycleManager::new(&self.datastore, task_dir, self.lineage.clone(), self.tasks.clone())
            .unwrap()
            .with_task(task)
    }

    fn manager(&self, task: TaskContext) -> FileLifecycleManager {
        self.manager_in(&self.task_dir, task)
    }

    fn write_datastore_file(&self, relative: &str) {
        let path = self.datastore.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, relative.as_bytes()).unwrap();
    }

    fn register(&self, task: i64, node: NodeId) {
        self.tasks.register_task(TaskId::new(task), node).unwrap();
    }
}

fn raw_category() -> FileCategory {
    FileCategory::new("raw", r"raw-([0-9]+)\.dat", r"raw/$1/raw-$1\.dat").unwrap()
}

fn names(paths: &BTreeSet<PathBuf>) -> BTreeSet<String> {
    paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn mode_of(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

/// Three datastore files: 1 consumed by tasks 10 and (without output) 11,
/// 2 consumed by task 12, 3 never consumed.
fn seed_consumed_files(fx: &Fixture) {
    for n in 1..=3 {
        fx.write_datastore_file(&format!("raw/{n}/raw-{n}.dat"));
    }
    fx.lineage
        .add_consumer(TaskId::new(10), ["raw/1/raw-1.dat"])
        .unwrap();
    fx.lineage
        .add_non_producing_consumer(TaskId::new(11), ["raw/1/raw-1.dat"])
        .unwrap();
    fx.lineage
        .add_consumer(TaskId::new(12), ["raw/2/raw-2.dat"])
        .unwrap();
}

#[test]
fn test_commit_records_producer_and_write_protects() {
    let fx = Fixture::new();
    fs::write(fx.task_dir.join("raw-1.dat"), b"one").unwrap();
    fs::write(fx.task_dir.join("raw-2.dat"), b"two").unwrap();
    fs::write(fx.task_dir.join("scratch.tmp"), b"").unwrap();

    let category = raw_category();
    let moved = fx
        .manager(TaskContext::new(TaskId::new(1), NODE))
        .move_task_dir_files_to_datastore(&[&category])
        .unwrap();

    assert_eq!(
        names(&moved["raw"]),
        set(&["raw/1/raw-1.dat", "raw/2/raw-2.dat"])
    );
    let dest = fx.datastore.join("raw/1/raw-1.dat");
    assert_eq!(fs::read(&dest).unwrap(), b"one");
    assert_eq!(mode_of(&dest), 0o444);
    assert!(!fx.task_dir.join("raw-1.dat").exists());
    assert!(fx.task_dir.join("scratch.tmp").exists());

    let producers = fx
        .lineage
        .retrieve_producers(&moved["raw"])
        .unwrap();
    assert_eq!(producers, BTreeSet::from([TaskId::new(1)]));
}

#[test]
fn test_recommit_overwrites_and_last_producer_wins() {
    let fx = Fixture::new();
    let category = raw_category();

    fs::write(fx.task_dir.join("raw-1.dat"), b"first").unwrap();
    fx.manager(TaskContext::new(TaskId::new(1), NODE))
        .move_task_dir_files_to_datastore(&[&category])
        .unwrap();

    fs::write(fx.task_dir.join("raw-1.dat"), b"second").unwrap();
    fx.manager(TaskContext::new(TaskId::new(2), NODE))
        .move_task_dir_files_to_datastore(&[&category])
        .unwrap();

    let dest = fx.datastore.join("raw/1/raw-1.dat");
    assert_eq!(fs::read(&dest).unwrap(), b"second");
    assert_eq!(mode_of(&dest), 0o444);
    let all = fx.lineage.retrieve_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].producer, TaskId::new(2));
    assert_eq!(all[0].file_type, DataFileType::Data);
}

#[test]
fn test_stage_replaces_producer_set() {
    let fx = Fixture::new();
    let category = raw_category();
    fs::write(fx.task_dir.join("raw-1.dat"), b"one").unwrap();
    fx.manager(TaskContext::new(TaskId::new(1), NODE))
        .move_task_dir_files_to_datastore(&[&category])
        .unwrap();
    fx.write_datastore_file("raw/2/raw-2.dat");

    let consumer_dir = fx.temp.path().join("task-30");
    fs::create_dir_all(&consumer_dir).unwrap();
    let task = TaskId::new(30);
    fx.tasks
        .replace_producer_task_ids(task, &BTreeSet::from([TaskId::new(99)]))
        .unwrap();

    let staged = fx
        .manager_in(&consumer_dir, TaskContext::new(task, OTHER_NODE))
        .copy_datastore_files_to_task_dir(Path::new("raw"), &[&category])
        .unwrap();

    assert_eq!(
        names(&staged["raw"]),
        set(&["raw/1/raw-1.dat", "raw/2/raw-2.dat"])
    );
    assert_eq!(fs::read(consumer_dir.join("raw-1.dat")).unwrap(), b"one");
    assert_eq!(
        fx.tasks.producer_task_ids(task).unwrap(),
        BTreeSet::from([TaskId::new(1)])
    );
}

#[test]
fn test_symlink_staging_links_to_datastore() {
    let fx = Fixture::new();
    fx.write_datastore_file("raw/4/raw-4.dat");
    let category = raw_category();

    fx.manager(TaskContext::new(TaskId::new(20), NODE))
        .use_symlinks(true)
        .copy_datastore_files_to_task_dir(Path::new(""), &[&category])
        .unwrap();

    let staged = fx.task_dir.join("raw-4.dat");
    assert!(fs::symlink_metadata(&staged)
        .unwrap()
        .file_type()
        .is_symlink());
    assert_eq!(
        fs::read_link(&staged).unwrap(),
        fx.datastore.join("raw/4/raw-4.dat")
    );
}

/// `path` spelled relative to the current directory.
fn relative_to_cwd(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap();
    let mut relative = PathBuf::new();
    for _ in cwd.components().skip(1) {
        relative.push("..");
    }
    relative.join(path.strip_prefix("/").unwrap())
}

#[test]
fn test_symlink_staging_with_relative_datastore_root() {
    let fx = Fixture::new();
    fx.write_datastore_file("raw/6/raw-6.dat");
    let category = raw_category();
    let relative_root = relative_to_cwd(&fx.datastore);
    assert!(relative_root.is_relative());

    FileLifecycleManager::new(relative_root, &fx.task_dir, fx.lineage.clone(), fx.tasks.clone())
        .unwrap()
        .with_task(TaskContext::new(TaskId::new(20), NODE))
        .use_symlinks(true)
        .copy_datastore_files_to_task_dir(Path::new(""), &[&category])
        .unwrap();

    let staged = fx.task_dir.join("raw-6.dat");
    assert!(fs::read_link(&staged).unwrap().is_absolute());
    assert_eq!(fs::read(&staged).unwrap(), b"raw/6/raw-6.dat");
}

#[test]
fn test_keep_up_excludes_non_producing_consumer_on_same_node() {
    let fx = Fixture::new();
    seed_consumed_files(&fx);
    fx.register(10, OTHER_NODE);
    fx.register(11, NODE);
    fx.register(12, OTHER_NODE);

    let task = TaskContext::new(TaskId::new(20), NODE).with_reprocessing(ReprocessingConfig::keep_up());
    let category = raw_category();
    let inputs = fx
        .manager(task)
        .datastore_files_for_inputs(Path::new("raw"), &[&category])
        .unwrap();

    assert_eq!(names(&inputs), set(&["raw/2/raw-2.dat", "raw/3/raw-3.dat"]));
}

#[test]
fn test_bugfix_with_other_node_exclusion_filters_nothing() {
    let fx = Fixture::new();
    seed_consumed_files(&fx);
    fx.register(10, OTHER_NODE);
    fx.register(12, OTHER_NODE);

    let task = TaskContext::new(TaskId::new(20), NODE)
        .with_reprocessing(ReprocessingConfig::bugfix([TaskId::new(10), TaskId::new(12)]));
    let category = raw_category();
    let inputs = fx
        .manager(task)
        .datastore_files_for_inputs(Path::new("raw"), &[&category])
        .unwrap();

    assert_eq!(inputs.len(), 3);
}

#[test]
fn test_bugfix_ignores_non_producing_consumers() {
    let fx = Fixture::new();
    seed_consumed_files(&fx);
    fx.register(11, NODE);
    fx.register(12, NODE);

    let task = TaskContext::new(TaskId::new(20), NODE)
        .with_reprocessing(ReprocessingConfig::bugfix([TaskId::new(11), TaskId::new(12)]));
    let category = raw_category();
    let inputs = fx
        .manager(task)
        .datastore_files_for_inputs(Path::new("raw"), &[&category])
        .unwrap();

    assert_eq!(names(&inputs), set(&["raw/1/raw-1.dat", "raw/3/raw-3.dat"]));
}

#[test]
fn test_full_reprocessing_and_missing_settings_do_not_filter() {
    let fx = Fixture::new();
    seed_consumed_files(&fx);
    fx.register(11, NODE);
    let category = raw_category();

    let full = TaskContext::new(TaskId::new(20), NODE).with_reprocessing(ReprocessingConfig::full());
    assert_eq!(
        fx.manager(full)
            .count_datastore_files_of_category(&category, Path::new("raw"))
            .unwrap(),
        3
    );

    let unset = TaskContext::new(TaskId::new(20), NODE);
    assert_eq!(
        fx.manager(unset)
            .count_datastore_files_of_category(&category, Path::new("raw"))
            .unwrap(),
        3
    );
}

#[test]
fn test_commit_of_symlinked_file_relinks_original_path() {
    let fx = Fixture::new();
    let outside = fx.temp.path().join("scratch");
    fs::create_dir_all(&outside).unwrap();
    let real = outside.join("raw-5.dat");
    fs::write(&real, b"five").unwrap();
    std::os::unix::fs::symlink(&real, fx.task_dir.join("raw-5.dat")).unwrap();

    let category = raw_category();
    fx.manager(TaskContext::new(TaskId::new(1), NODE))
        .move_task_dir_files_to_datastore(&[&category])
        .unwrap();

    let dest = fx.datastore.join("raw/5/raw-5.dat");
    assert!(fs::symlink_metadata(&dest).unwrap().file_type().is_file());
    assert_eq!(fs::read_link(fx.task_dir.join("raw-5.dat")).unwrap(), dest);
    assert_eq!(fs::read(fx.task_dir.join("raw-5.dat")).unwrap(), b"five");
    assert!(!real.exists());
}

#[test]
fn test_partial_commit_keeps_provenance_of_moved_files() {
    let fx = Fixture::new();
    fs::write(fx.task_dir.join("raw-1.dat"), b"one").unwrap();
    fs::write(fx.task_dir.join("raw-2.dat"), b"two").unwrap();
    // A regular file where raw-2's parent directory must go.
    fs::create_dir_all(fx.datastore.join("raw")).unwrap();
    fs::write(fx.datastore.join("raw/2"), b"blocker").unwrap();

    let category = raw_category();
    let err = fx
        .manager(TaskContext::new(TaskId::new(1), NODE))
        .move_task_dir_files_to_datastore(&[&category])
        .unwrap_err();

    assert!(matches!(err, DatastoreError::Io { .. }));
    assert!(err.to_string().contains("raw/2"));
    assert!(fx.datastore.join("raw/1/raw-1.dat").is_file());
    assert!(fx.task_dir.join("raw-2.dat").is_file());

    let all = fx.lineage.retrieve_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].filename, "raw/1/raw-1.dat");
    assert_eq!(all[0].producer, TaskId::new(1));
}

#[test]
fn test_completed_subtask_scan_splits_on_results_flag() {
    let fx = Fixture::new();
    let mut config = TaskConfiguration::new(&fx.task_dir);
    let mut dirs = Vec::new();
    for n in 1..=3 {
        let dir = config
            .add_files_for_subtask(BTreeSet::from([format!("raw-{n}.dat")]))
            .unwrap();
        fs::write(dir.join(format!("raw-{n}.dat")), b"x").unwrap();
        dirs.push(dir);
    }
    config.persist().unwrap();

    let with_results = AlgorithmStateFiles::new(&dirs[0]);
    with_results.update_current_state(SubtaskState::Complete).unwrap();
    with_results.set_results_flag().unwrap();
    AlgorithmStateFiles::new(&dirs[1])
        .update_current_state(SubtaskState::Complete)
        .unwrap();
    AlgorithmStateFiles::new(&dirs[2])
        .update_current_state(SubtaskState::Failed)
        .unwrap();

    let category = raw_category();
    let manager = fx.manager(TaskContext::new(TaskId::new(20), NODE));
    assert_eq!(
        manager
            .datastore_files_in_completed_subtasks_with_results(&[&category])
            .unwrap(),
        set(&["raw/1/raw-1.dat"])
    );
    assert_eq!(
        manager
            .datastore_files_in_completed_subtasks_without_results(&[&category])
            .unwrap(),
        set(&["raw/2/raw-2.dat"])
    );
}

#[test]
fn test_model_files_are_staged_under_original_names() {
    let fx = Fixture::new();
    fx.write_datastore_file("models/geometry/geometry-v3.xml");
    let mut registry = ModelRegistry::default();
    registry.insert("geometry", ModelMetadata::new("geometry.xml", "geometry-v3.xml"));

    let manager = fx.manager(TaskContext::new(TaskId::new(20), NODE));
    let staged = manager
        .copy_model_files_to_task_dir(&registry, ["geometry"])
        .unwrap();

    assert_eq!(staged, vec!["geometry.xml".to_string()]);
    assert_eq!(
        fs::read_to_string(fx.task_dir.join("geometry.xml")).unwrap(),
        "models/geometry/geometry-v3.xml"
    );
    assert!(matches!(
        manager.copy_model_files_to_task_dir(&registry, ["read-noise"]),
        Err(DatastoreError::Model(_))
    ));
}

#[test]
fn test_failed_imports_accumulate() {
    let fx = Fixture::new();
    let files = BTreeSet::from([PathBuf::from("raw/1/raw-1.dat")]);
    for _ in 0..2 {
        fx.lineage
            .create_failed_imports(TaskId::new(20), &files, DataFileType::Data)
            .unwrap();
    }
    assert_eq!(
        fx.lineage
            .retrieve_failed_imports(TaskId::new(20))
            .unwrap()
            .len(),
        2
    );
}
