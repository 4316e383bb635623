//! Pipeline task lookups the lifecycle manager needs from the orchestrator.

use crate::error::Result;
use crate::lineage::IN_CHUNK;
use std::collections::BTreeSet;
use strata_db::{placeholders, DbConnection, DbValue};
use strata_ids::{NodeId, TaskId};
use tracing::debug;

/// Task queries consumed by [`crate::manager::FileLifecycleManager`].
pub trait PipelineTasks: Send + Sync {
    /// The subset of `candidates` that ran on `node`.
    fn ids_for_node(&self, candidates: &BTreeSet<TaskId>, node: NodeId) -> Result<BTreeSet<TaskId>>;

    /// Replace the recorded producer set of `task`.
    fn replace_producer_task_ids(&self, task: TaskId, producers: &BTreeSet<TaskId>) -> Result<()>;
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_tasks (
    id INTEGER PRIMARY KEY,
    node_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_task_producers (
    task_id INTEGER NOT NULL,
    producer_id INTEGER NOT NULL,
    PRIMARY KEY (task_id, producer_id)
);
"#;

/// [`PipelineTasks`] over the shared ledger database.
#[derive(Debug, Clone)]
pub struct SqlPipelineTasks {
    conn: DbConnection,
}

impl SqlPipelineTasks {
    pub fn open(conn: DbConnection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn register_task(&self, task: TaskId, node: NodeId) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pipeline_tasks (id, node_id) VALUES (?, ?) \
             ON CONFLICT(id) DO UPDATE SET node_id = excluded.node_id",
            &[DbValue::from(task.get()), DbValue::from(node.get())],
        )?;
        Ok(())
    }

    pub fn node_for_task(&self, task: TaskId) -> Result<Option<NodeId>> {
        let node: Option<i64> = self
            .conn
            .query_optional(
                "SELECT node_id FROM pipeline_tasks WHERE id = ?",
                &[DbValue::from(task.get())],
            )?
            .map(|row| row.get(0))
            .transpose()?;
        Ok(node.map(NodeId::new))
    }

    pub fn producer_task_ids(&self, task: TaskId) -> Result<BTreeSet<TaskId>> {
        let rows = self.conn.query_all(
            "SELECT producer_id FROM pipeline_task_producers WHERE task_id = ? ORDER BY producer_id",
            &[DbValue::from(task.get())],
        )?;
        let mut producers = BTreeSet::new();
        for row in &rows {
            producers.insert(TaskId::new(row.get(0)?));
        }
        Ok(producers)
    }
}

impl PipelineTasks for SqlPipelineTasks {
    fn ids_for_node(&self, candidates: &BTreeSet<TaskId>, node: NodeId) -> Result<BTreeSet<TaskId>> {
        let candidates: Vec<TaskId> = candidates.iter().copied().collect();
        let mut matching = BTreeSet::new();
        for chunk in candidates.chunks(IN_CHUNK) {
            let mut params = vec![DbValue::from(node.get())];
            params.extend(chunk.iter().map(|t| DbValue::from(t.get())));
            let sql = format!(
                "SELECT id FROM pipeline_tasks WHERE node_id = ? AND id IN ({})",
                placeholders(chunk.len())
            );
            for row in self.conn.query_all(&sql, &params)? {
                matching.insert(TaskId::new(row.get(0)?));
            }
        }
        Ok(matching)
    }

    fn replace_producer_task_ids(&self, task: TaskId, producers: &BTreeSet<TaskId>) -> Result<()> {
        self.conn.transaction(|tx| {
            tx.execute(
                "DELETE FROM pipeline_task_producers WHERE task_id = ?",
                &[DbValue::from(task.get())],
            )?;
            for producer in producers {
                tx.execute(
                    "INSERT OR IGNORE INTO pipeline_task_producers (task_id, producer_id) VALUES (?, ?)",
                    &[DbValue::from(task.get()), DbValue::from(producer.get())],
                )?;
            }
            Ok(())
        })?;
        debug!(task_id = %task, producers = producers.len(), "Replaced producer task ids");
        Ok(())
    }
}
