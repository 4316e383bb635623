//! Producer/consumer ledger for datastore files, plus the failed-import log.
//!
//! One row per datastore-relative filename holds the producing task; the
//! consumer set lives in a child table. A negative consumer id marks a task
//! that finished with the file as input but produced no output. Rows are
//! never deleted.

use crate::error::{DatastoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use strata_db::{placeholders, DbConnection, DbRow, DbTimestamp, DbTransaction, DbValue};
use strata_ids::TaskId;
use tracing::{debug, info};

/// Filenames per `IN (...)` clause; stays well under SQLite's parameter cap.
pub(crate) const IN_CHUNK: usize = 500;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS datastore_producer_consumer (
    filename TEXT PRIMARY KEY,
    producer_id INTEGER NOT NULL DEFAULT 0,
    file_type TEXT NOT NULL DEFAULT 'DATA'
);

CREATE TABLE IF NOT EXISTS datastore_consumers (
    filename TEXT NOT NULL REFERENCES datastore_producer_consumer(filename),
    consumer_id INTEGER NOT NULL,
    PRIMARY KEY (filename, consumer_id)
);

CREATE INDEX IF NOT EXISTS idx_datastore_consumers_consumer
    ON datastore_consumers(consumer_id);
CREATE INDEX IF NOT EXISTS idx_datastore_producer_consumer_producer
    ON datastore_producer_consumer(producer_id);

CREATE TABLE IF NOT EXISTS failed_imports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    filename TEXT NOT NULL,
    file_type TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_failed_imports_task ON failed_imports(task_id);
"#;

/// Kind of file tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataFileType {
    Data,
    Model,
}

impl DataFileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFileType::Data => "DATA",
            DataFileType::Model => "MODEL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DATA" => Some(DataFileType::Data),
            "MODEL" => Some(DataFileType::Model),
            _ => None,
        }
    }
}

impl fmt::Display for DataFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger entry for one datastore file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub filename: String,
    pub producer: TaskId,
    /// Raw consumer ids; negative ids are non-producing consumers.
    pub consumer_ids: BTreeSet<i64>,
    pub file_type: DataFileType,
    /// False for placeholders synthesized for files the ledger has never seen.
    pub persisted: bool,
}

impl LineageRecord {
    fn placeholder(filename: String) -> Self {
        Self {
            filename,
            producer: TaskId::UNPRODUCED,
            consumer_ids: BTreeSet::new(),
            file_type: DataFileType::Data,
            persisted: false,
        }
    }

    /// Every task that consumed the file, with or without producing output.
    pub fn all_consumers(&self) -> BTreeSet<TaskId> {
        self.consumer_ids
            .iter()
            .map(|id| TaskId::from_consumer_id(*id))
            .collect()
    }

    /// Tasks that consumed the file and produced output.
    pub fn consumers(&self) -> BTreeSet<TaskId> {
        self.consumer_ids
            .iter()
            .filter(|id| **id > 0)
            .map(|id| TaskId::new(*id))
            .collect()
    }

    pub fn is_placeholder(&self) -> bool {
        !self.persisted
    }
}

/// One failed attempt to import a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedImportRecord {
    pub id: i64,
    pub task_id: TaskId,
    pub filename: String,
    pub file_type: DataFileType,
    pub created_at: DbTimestamp,
}

impl FailedImportRecord {
    fn from_row(row: &DbRow) -> Result<Self> {
        let file_type: String = row.get_by_name("file_type")?;
        Ok(Self {
            id: row.get_by_name("id")?,
            task_id: TaskId::new(row.get_by_name("task_id")?),
            filename: row.get_by_name("filename")?,
            file_type: parse_file_type(&file_type)?,
            created_at: row.get_by_name("created_at")?,
        })
    }
}

fn parse_file_type(value: &str) -> Result<DataFileType> {
    DataFileType::parse(value)
        .ok_or_else(|| DatastoreError::InvalidState(format!("unknown file type '{}'", value)))
}

/// Ledger name for a datastore-relative path: `/`-separated.
pub fn datastore_name(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Producer/consumer ledger backed by a [`DbConnection`].
#[derive(Debug, Clone)]
pub struct LineageStore {
    conn: DbConnection,
}

impl LineageStore {
    /// Wrap a connection, creating the ledger tables if needed.
    pub fn open(conn: DbConnection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &DbConnection {
        &self.conn
    }

    /// Records for `names`; unknown names get unpersisted placeholders with
    /// producer 0. Results are ordered by filename.
    pub fn retrieve_or_create<I, S>(&self, names: I) -> Result<Vec<LineageRecord>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: BTreeSet<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        let mut found = self.load_records(&names)?;
        Ok(names
            .into_iter()
            .map(|name| {
                found
                    .remove(&name)
                    .unwrap_or_else(|| LineageRecord::placeholder(name))
            })
            .collect())
    }

    /// Records for datastore-relative paths, placeholders included.
    pub fn retrieve_by_filename(&self, files: &BTreeSet<PathBuf>) -> Result<Vec<LineageRecord>> {
        self.retrieve_or_create(files.iter().map(|p| datastore_name(p)))
    }

    /// Set `task` as the producer of each file; last writer wins.
    pub fn create_or_update_producer(
        &self,
        task: TaskId,
        files: &BTreeSet<PathBuf>,
        file_type: DataFileType,
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        self.conn.transaction(|tx| {
            for file in files {
                tx.execute(
                    "INSERT INTO datastore_producer_consumer (filename, producer_id, file_type) \
                     VALUES (?, ?, ?) \
                     ON CONFLICT(filename) DO UPDATE SET \
                     producer_id = excluded.producer_id, file_type = excluded.file_type",
                    &[
                        DbValue::from(datastore_name(file)),
                        DbValue::from(task.get()),
                        DbValue::from(file_type.as_str()),
                    ],
                )?;
            }
            Ok(())
        })?;
        info!(task_id = %task, files = files.len(), file_type = %file_type, "Recorded producer");
        Ok(())
    }

    /// Distinct producers of the given files. Files without a producer are
    /// skipped.
    pub fn retrieve_producers(&self, files: &BTreeSet<PathBuf>) -> Result<BTreeSet<TaskId>> {
        Ok(self
            .retrieve_by_filename(files)?
            .into_iter()
            .map(|record| record.producer)
            .filter(|producer| *producer != TaskId::UNPRODUCED)
            .collect())
    }

    /// Record `task` as a consumer that produced output.
    pub fn add_consumer<I, S>(&self, task: TaskId, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.insert_consumers(task.get(), names)
    }

    /// Record `task` as a consumer that produced no output.
    pub fn add_non_producing_consumer<I, S>(&self, task: TaskId, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.insert_consumers(task.non_producing_marker(), names)
    }

    fn insert_consumers<I, S>(&self, consumer_id: i64, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: BTreeSet<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        if names.is_empty() {
            return Ok(());
        }
        self.conn.transaction(|tx| {
            for name in &names {
                tx.execute(
                    "INSERT OR IGNORE INTO datastore_producer_consumer (filename, producer_id, file_type) \
                     VALUES (?, 0, 'DATA')",
                    &[DbValue::from(name.as_str())],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO datastore_consumers (filename, consumer_id) VALUES (?, ?)",
                    &[DbValue::from(name.as_str()), DbValue::from(consumer_id)],
                )?;
            }
            Ok(())
        })?;
        debug!(consumer_id, files = names.len(), "Recorded consumer");
        Ok(())
    }

    /// Files consumed by `task` (as a producing consumer).
    pub fn retrieve_files_consumed_by_task(&self, task: TaskId) -> Result<BTreeSet<String>> {
        self.retrieve_files_consumed_by_tasks(&BTreeSet::from([task]), None)
    }

    /// Files consumed by any of `tasks`, optionally restricted to `filter_names`.
    pub fn retrieve_files_consumed_by_tasks(
        &self,
        tasks: &BTreeSet<TaskId>,
        filter_names: Option<&BTreeSet<String>>,
    ) -> Result<BTreeSet<String>> {
        if tasks.is_empty() {
            return Ok(BTreeSet::new());
        }
        let task_params: Vec<DbValue> = tasks.iter().map(|t| DbValue::from(t.get())).collect();
        let mut files = BTreeSet::new();

        match filter_names {
            Some(names) if !names.is_empty() => {
                let names: Vec<&String> = names.iter().collect();
                for chunk in names.chunks(IN_CHUNK) {
                    let sql = format!(
                        "SELECT DISTINCT filename FROM datastore_consumers \
                         WHERE consumer_id IN ({}) AND filename IN ({})",
                        placeholders(task_params.len()),
                        placeholders(chunk.len())
                    );
                    let mut params = task_params.clone();
                    params.extend(chunk.iter().map(|n| DbValue::from(n.as_str())));
                    for row in self.conn.query_all(&sql, &params)? {
                        files.insert(row.get::<String>(0)?);
                    }
                }
            }
            _ => {
                let sql = format!(
                    "SELECT DISTINCT filename FROM datastore_consumers WHERE consumer_id IN ({})",
                    placeholders(task_params.len())
                );
                for row in self.conn.query_all(&sql, &task_params)? {
                    files.insert(row.get::<String>(0)?);
                }
            }
        }
        Ok(files)
    }

    /// Inputs of the tasks that produced `produced_files`.
    pub fn retrieve_consumed_files(
        &self,
        produced_files: &BTreeSet<PathBuf>,
    ) -> Result<BTreeSet<String>> {
        if produced_files.is_empty() {
            return Ok(BTreeSet::new());
        }
        let names: Vec<String> = produced_files.iter().map(|p| datastore_name(p)).collect();
        let mut producers = BTreeSet::new();
        for chunk in names.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT DISTINCT producer_id FROM datastore_producer_consumer WHERE filename IN ({})",
                placeholders(chunk.len())
            );
            let params: Vec<DbValue> = chunk.iter().map(|n| DbValue::from(n.as_str())).collect();
            for row in self.conn.query_all(&sql, &params)? {
                producers.insert(TaskId::new(row.get(0)?));
            }
        }
        self.retrieve_files_consumed_by_tasks(&producers, None)
    }

    /// Producers of every file `consumer` consumed.
    pub fn retrieve_producer_ids(&self, consumer: TaskId) -> Result<BTreeSet<TaskId>> {
        let rows = self.conn.query_all(
            "SELECT DISTINCT p.producer_id FROM datastore_consumers c \
             JOIN datastore_producer_consumer p ON p.filename = c.filename \
             WHERE c.consumer_id = ?",
            &[DbValue::from(consumer.get())],
        )?;
        let mut producers = BTreeSet::new();
        for row in &rows {
            producers.insert(TaskId::new(row.get(0)?));
        }
        Ok(producers)
    }

    /// Every persisted record.
    pub fn retrieve_all(&self) -> Result<Vec<LineageRecord>> {
        let rows = self.conn.query_all(
            "SELECT filename, producer_id, file_type FROM datastore_producer_consumer \
             ORDER BY filename",
            &[],
        )?;
        let mut records = BTreeMap::new();
        for row in &rows {
            let record = record_from_row(row)?;
            records.insert(record.filename.clone(), record);
        }
        let consumer_rows = self.conn.query_all(
            "SELECT filename, consumer_id FROM datastore_consumers",
            &[],
        )?;
        attach_consumers(&mut records, &consumer_rows)?;
        Ok(records.into_values().collect())
    }

    /// The subset of `files` with no ledger row.
    pub fn new_files(&self, files: &BTreeSet<PathBuf>) -> Result<BTreeSet<PathBuf>> {
        let by_name: BTreeMap<String, &PathBuf> =
            files.iter().map(|p| (datastore_name(p), p)).collect();
        let names: BTreeSet<String> = by_name.keys().cloned().collect();
        let known = self.load_records(&names)?;
        Ok(by_name
            .into_iter()
            .filter(|(name, _)| !known.contains_key(name))
            .map(|(_, path)| path.clone())
            .collect())
    }

    /// Append one failed-import row per file. Repeats are kept.
    pub fn create_failed_imports(
        &self,
        task: TaskId,
        files: &BTreeSet<PathBuf>,
        file_type: DataFileType,
    ) -> Result<usize> {
        if files.is_empty() {
            return Ok(0);
        }
        let now = DbTimestamp::now();
        let rows: Vec<Vec<DbValue>> = files
            .iter()
            .map(|file| {
                vec![
                    DbValue::from(task.get()),
                    DbValue::from(datastore_name(file)),
                    DbValue::from(file_type.as_str()),
                    DbValue::from(now.clone()),
                ]
            })
            .collect();
        let inserted = self.conn.transaction(|tx: &mut DbTransaction<'_>| {
            tx.bulk_insert_rows(
                "failed_imports",
                &["task_id", "filename", "file_type", "created_at"],
                &rows,
            )
        })?;
        info!(task_id = %task, files = inserted, "Recorded failed imports");
        Ok(inserted as usize)
    }

    /// Failed-import rows for `task`, oldest first.
    pub fn retrieve_failed_imports(&self, task: TaskId) -> Result<Vec<FailedImportRecord>> {
        let rows = self.conn.query_all(
            "SELECT id, task_id, filename, file_type, created_at FROM failed_imports \
             WHERE task_id = ? ORDER BY id",
            &[DbValue::from(task.get())],
        )?;
        rows.iter().map(FailedImportRecord::from_row).collect()
    }

    fn load_records(&self, names: &BTreeSet<String>) -> Result<BTreeMap<String, LineageRecord>> {
        let mut records = BTreeMap::new();
        let names: Vec<&String> = names.iter().collect();
        for chunk in names.chunks(IN_CHUNK) {
            let params: Vec<DbValue> = chunk.iter().map(|n| DbValue::from(n.as_str())).collect();
            let rows = self.conn.query_all(
                &format!(
                    "SELECT filename, producer_id, file_type FROM datastore_producer_consumer \
                     WHERE filename IN ({})",
                    placeholders(chunk.len())
                ),
                &params,
            )?;
            for row in &rows {
                let record = record_from_row(row)?;
                records.insert(record.filename.clone(), record);
            }
            let consumer_rows = self.conn.query_all(
                &format!(
                    "SELECT filename, consumer_id FROM datastore_consumers WHERE filename IN ({})",
                    placeholders(chunk.len())
                ),
                &params,
            )?;
            attach_consumers(&mut records, &consumer_rows)?;
        }
        Ok(records)
    }
}

fn record_from_row(row: &DbRow) -> Result<LineageRecord> {
    let file_type: String = row.get_by_name("file_type")?;
    Ok(LineageRecord {
        filename: row.get_by_name("filename")?,
        producer: TaskId::new(row.get_by_name("producer_id")?),
        consumer_ids: BTreeSet::new(),
        file_type: parse_file_type(&file_type)?,
        persisted: true,
    })
}

fn attach_consumers(records: &mut BTreeMap<String, LineageRecord>, rows: &[DbRow]) -> Result<()> {
    for row in rows {
        let filename: String = row.get(0)?;
        let consumer_id: i64 = row.get(1)?;
        if let Some(record) = records.get_mut(&filename) {
            record.consumer_ids.insert(consumer_id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LineageStore {
        LineageStore::open(DbConnection::open_sqlite_memory().unwrap()).unwrap()
    }

    fn paths(names: &[&str]) -> BTreeSet<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn placeholders_are_not_persisted() {
        let store = store();
        let records = store.retrieve_or_create(["a/b.h5"]).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_placeholder());
        assert_eq!(records[0].producer, TaskId::UNPRODUCED);
        assert!(store.retrieve_all().unwrap().is_empty());
    }

    #[test]
    fn producer_updates_are_last_writer_wins() {
        let store = store();
        let files = paths(&["sector-1/a.h5"]);
        store
            .create_or_update_producer(TaskId::new(5), &files, DataFileType::Data)
            .unwrap();
        store
            .create_or_update_producer(TaskId::new(9), &files, DataFileType::Data)
            .unwrap();

        let all = store.retrieve_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].producer, TaskId::new(9));
        assert!(all[0].persisted);
    }

    #[test]
    fn consumers_keep_sign_for_non_producing_tasks() {
        let store = store();
        store.add_consumer(TaskId::new(10), ["f.h5"]).unwrap();
        store
            .add_non_producing_consumer(TaskId::new(11), ["f.h5"])
            .unwrap();
        store.add_consumer(TaskId::new(10), ["f.h5"]).unwrap();

        let record = store.retrieve_or_create(["f.h5"]).unwrap().remove(0);
        assert_eq!(record.consumer_ids, BTreeSet::from([-11, 10]));
        assert_eq!(
            record.all_consumers(),
            BTreeSet::from([TaskId::new(10), TaskId::new(11)])
        );
        assert_eq!(record.consumers(), BTreeSet::from([TaskId::new(10)]));
        assert_eq!(record.producer, TaskId::UNPRODUCED);
    }

    #[test]
    fn producers_skip_unproduced_files() {
        let store = store();
        store
            .create_or_update_producer(TaskId::new(3), &paths(&["a.h5"]), DataFileType::Data)
            .unwrap();
        let producers = store
            .retrieve_producers(&paths(&["a.h5", "never-seen.h5"]))
            .unwrap();
        assert_eq!(producers, BTreeSet::from([TaskId::new(3)]));
    }

    #[test]
    fn consumed_file_queries() {
        let store = store();
        store
            .create_or_update_producer(TaskId::new(1), &paths(&["in-1.h5", "in-2.h5"]), DataFileType::Data)
            .unwrap();
        store.add_consumer(TaskId::new(2), ["in-1.h5", "in-2.h5"]).unwrap();
        store
            .create_or_update_producer(TaskId::new(2), &paths(&["out.h5"]), DataFileType::Data)
            .unwrap();
        store.add_non_producing_consumer(TaskId::new(4), ["in-1.h5"]).unwrap();

        assert_eq!(
            store.retrieve_files_consumed_by_task(TaskId::new(2)).unwrap(),
            BTreeSet::from(["in-1.h5".to_string(), "in-2.h5".to_string()])
        );
        assert!(store
            .retrieve_files_consumed_by_task(TaskId::new(4))
            .unwrap()
            .is_empty());
        let filter = BTreeSet::from(["in-2.h5".to_string()]);
        assert_eq!(
            store
                .retrieve_files_consumed_by_tasks(&BTreeSet::from([TaskId::new(2)]), Some(&filter))
                .unwrap(),
            filter
        );
        assert_eq!(
            store.retrieve_consumed_files(&paths(&["out.h5"])).unwrap(),
            BTreeSet::from(["in-1.h5".to_string(), "in-2.h5".to_string()])
        );
        assert_eq!(
            store.retrieve_producer_ids(TaskId::new(2)).unwrap(),
            BTreeSet::from([TaskId::new(1)])
        );
    }

    #[test]
    fn new_files_are_those_without_rows() {
        let store = store();
        store
            .create_or_update_producer(TaskId::new(1), &paths(&["old.h5"]), DataFileType::Data)
            .unwrap();
        assert_eq!(
            store.new_files(&paths(&["old.h5", "new.h5"])).unwrap(),
            paths(&["new.h5"])
        );
    }

    #[test]
    fn failed_imports_are_not_unique() {
        let store = store();
        let files = paths(&["bad.h5"]);
        store
            .create_failed_imports(TaskId::new(7), &files, DataFileType::Data)
            .unwrap();
        store
            .create_failed_imports(TaskId::new(7), &files, DataFileType::Data)
            .unwrap();

        let failed = store.retrieve_failed_imports(TaskId::new(7)).unwrap();
        assert_eq!(failed.len(), 2);
        assert_ne!(failed[0].id, failed[1].id);
        assert!(failed.iter().all(|f| f.filename == "bad.h5"));
        assert!(store.retrieve_failed_imports(TaskId::new(8)).unwrap().is_empty());
    }

    #[test]
    fn model_file_type_round_trips() {
        let store = store();
        store
            .create_or_update_producer(TaskId::new(1), &paths(&["models/geometry/g-001.xml"]), DataFileType::Model)
            .unwrap();
        let record = store
            .retrieve_or_create(["models/geometry/g-001.xml"])
            .unwrap()
            .remove(0);
        assert_eq!(record.file_type, DataFileType::Model);
    }

    #[test]
    fn datastore_names_use_forward_slashes() {
        assert_eq!(datastore_name(Path::new("a/b/c.h5")), "a/b/c.h5");
    }
}
