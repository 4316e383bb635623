//! Database backend abstraction layer.
//!
//! SQLite-only synchronous backend.
//! - Row-oriented, suited to per-file ledger upserts
//! - One connection per handle, serialized behind a mutex so handles can be
//!   shared between threads

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug_span, info};

/// How long a writer waits on a locked database file before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from database backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database is locked by another process: {0}")]
    Locked(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Timestamp wrapper for database values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbTimestamp {
    inner: chrono::DateTime<chrono::Utc>,
}

/// Errors that can occur when parsing or constructing timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbTimestampError {
    message: String,
}

impl DbTimestampError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DbTimestampError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DbTimestampError {}

impl DbTimestamp {
    /// Current timestamp in UTC.
    pub fn now() -> Self {
        Self {
            inner: chrono::Utc::now(),
        }
    }

    /// Parse an RFC3339 timestamp string.
    pub fn from_rfc3339(value: &str) -> Result<Self, DbTimestampError> {
        chrono::DateTime::parse_from_rfc3339(value)
            .map(|dt| Self {
                inner: dt.with_timezone(&chrono::Utc),
            })
            .map_err(|e| DbTimestampError::new(format!("Invalid timestamp: {}", e)))
    }

    /// RFC3339 string representation.
    pub fn to_rfc3339(&self) -> String {
        self.inner.to_rfc3339()
    }
}

impl serde::Serialize for DbTimestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_rfc3339())
    }
}

impl<'de> serde::Deserialize<'de> for DbTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        DbTimestamp::from_rfc3339(&raw).map_err(serde::de::Error::custom)
    }
}

/// Value type for query parameters.
#[derive(Debug, Clone)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
    Timestamp(DbTimestamp),
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        DbValue::Integer(v as i64)
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Integer(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Real(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Boolean(v)
    }
}

impl From<DbTimestamp> for DbValue {
    fn from(v: DbTimestamp) -> Self {
        DbValue::Timestamp(v)
    }
}

impl From<Vec<u8>> for DbValue {
    fn from(v: Vec<u8>) -> Self {
        DbValue::Blob(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DbValue::Null,
        }
    }
}

/// Row data from a query result.
#[derive(Debug, Clone)]
pub struct DbRow {
    columns: Arc<[String]>,
    values: Vec<DbValue>,
}

impl DbRow {
    fn new(columns: Arc<[String]>, values: Vec<DbValue>) -> Self {
        Self { columns, values }
    }

    /// Get a value by column index.
    pub fn get<T: FromDbValue>(&self, index: usize) -> Result<T, BackendError> {
        self.values
            .get(index)
            .ok_or_else(|| {
                BackendError::TypeConversion(format!("Column index {} out of bounds", index))
            })
            .and_then(|v| T::from_db_value(v))
    }

    /// Get a value by column name.
    pub fn get_by_name<T: FromDbValue>(&self, name: &str) -> Result<T, BackendError> {
        let index = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| BackendError::TypeConversion(format!("Column '{}' not found", name)))?;
        self.get(index)
    }

}

/// Trait for converting from DbValue.
pub trait FromDbValue: Sized {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError>;
}

impl FromDbValue for i64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Integer(v) => Ok(*v),
            DbValue::Null => Err(BackendError::TypeConversion(
                "i64 field is NULL - use Option<i64> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected integer".to_string())),
        }
    }
}

impl FromDbValue for f64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Real(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v as f64),
            DbValue::Null => Err(BackendError::TypeConversion(
                "f64 field is NULL - use Option<f64> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected real".to_string())),
        }
    }
}

impl FromDbValue for String {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Text(v) => Ok(v.clone()),
            DbValue::Null => Err(BackendError::TypeConversion(
                "String field is NULL - use Option<String> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected text".to_string())),
        }
    }
}

impl FromDbValue for bool {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Boolean(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v != 0),
            DbValue::Null => Err(BackendError::TypeConversion(
                "bool field is NULL - use Option<bool> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected boolean".to_string())),
        }
    }
}

impl FromDbValue for DbTimestamp {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Timestamp(v) => Ok(v.clone()),
            DbValue::Text(v) => DbTimestamp::from_rfc3339(v)
                .map_err(|e| BackendError::TypeConversion(e.to_string())),
            DbValue::Null => Err(BackendError::TypeConversion(
                "DbTimestamp field is NULL - use Option<DbTimestamp> for nullable columns"
                    .to_string(),
            )),
            _ => Err(BackendError::TypeConversion(
                "Expected timestamp".to_string(),
            )),
        }
    }
}

impl<T: FromDbValue> FromDbValue for Option<T> {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Null => Ok(None),
            _ => T::from_db_value(value).map(Some),
        }
    }
}

/// Unified database connection.
///
/// Cloning shares the underlying connection; every statement and every
/// transaction holds the connection mutex for its whole duration.
#[derive(Clone)]
pub struct DbConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("backend", &"SQLite")
            .finish_non_exhaustive()
    }
}

impl DbConnection {
    /// Open or create a SQLite database file.
    pub fn open_sqlite(path: &Path) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BackendError::Database(format!(
                        "Unable to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = rusqlite::Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        info!(path = %path.display(), journal_mode = %mode, "Opened SQLite database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database (for testing).
    pub fn open_sqlite_memory() -> Result<Self, BackendError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        info!("Opened in-memory SQLite database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, BackendError> {
        self.conn
            .lock()
            .map_err(|_| BackendError::Database("connection mutex poisoned".to_string()))
    }

    /// Execute a SQL statement (no results).
    pub fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        let conn = self.lock()?;
        execute_on_conn(&conn, sql, params)
    }

    /// Execute a batch of SQL statements.
    pub fn execute_batch(&self, sql: &str) -> Result<(), BackendError> {
        let conn = self.lock()?;
        execute_batch_on_conn(&conn, sql)
    }

    /// Bulk insert rows into a table.
    ///
    /// Column order must match the row value order.
    pub fn bulk_insert_rows(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<DbValue>],
    ) -> Result<u64, BackendError> {
        let conn = self.lock()?;
        bulk_insert_rows_internal(
            |sql, params| execute_on_conn(&conn, sql, params),
            table,
            columns,
            rows,
        )
    }

    /// Query and return all rows.
    pub fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        let conn = self.lock()?;
        query_on_conn(&conn, sql, params)
    }

    /// Query and return the first row, if any.
    pub fn query_optional(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<Option<DbRow>, BackendError> {
        let rows = self.query_all(sql, params)?;
        Ok(rows.into_iter().next())
    }

    /// Query and return the first column of exactly one row.
    pub fn query_scalar<T: FromDbValue>(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        self.query_optional(sql, params)?
            .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))?
            .get(0)
    }

    /// Run `op` inside a single write transaction.
    ///
    /// `BEGIN IMMEDIATE` takes the SQLite write lock up front, so concurrent
    /// writers in other processes queue on the busy timeout instead of
    /// failing at commit.
    pub fn transaction<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        F: FnOnce(&mut DbTransaction<'_>) -> Result<T, BackendError>,
    {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let mut tx = DbTransaction { conn: &conn };
        let result = op(&mut tx);

        match result {
            Ok(value) => match conn.execute_batch("COMMIT") {
                Ok(()) => Ok(value),
                Err(commit_err) => Err(rollback(&conn, BackendError::from(commit_err))),
            },
            Err(err) => Err(rollback(&conn, err)),
        }
    }
}

/// Roll back an open transaction after `err`, keeping `err` as the cause.
///
/// SQLite rolls some failed commits back itself; a connection already back
/// in autocommit mode is left alone.
fn rollback(conn: &rusqlite::Connection, err: BackendError) -> BackendError {
    if conn.is_autocommit() {
        return err;
    }
    match conn.execute_batch("ROLLBACK") {
        Ok(()) => err,
        Err(rollback_err) => BackendError::Transaction(format!(
            "Transaction failed: {}; rollback failed: {}",
            err, rollback_err
        )),
    }
}

/// Transaction handle passed to [`DbConnection::transaction`].
pub struct DbTransaction<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> DbTransaction<'a> {
    pub fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        execute_on_conn(self.conn, sql, params)
    }

    pub fn execute_batch(&mut self, sql: &str) -> Result<(), BackendError> {
        execute_batch_on_conn(self.conn, sql)
    }

    pub fn query_all(&mut self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        query_on_conn(self.conn, sql, params)
    }

    pub fn query_optional(
        &mut self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<Option<DbRow>, BackendError> {
        let rows = self.query_all(sql, params)?;
        Ok(rows.into_iter().next())
    }

    pub fn query_scalar<T: FromDbValue>(
        &mut self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        self.query_optional(sql, params)?
            .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))?
            .get(0)
    }

    /// Bulk insert rows into a table within this transaction.
    pub fn bulk_insert_rows(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<DbValue>],
    ) -> Result<u64, BackendError> {
        let conn = self.conn;
        bulk_insert_rows_internal(
            |sql, params| execute_on_conn(conn, sql, params),
            table,
            columns,
            rows,
        )
    }
}

fn execute_on_conn(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<u64, BackendError> {
    let span = debug_span!(
        "db.exec",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.execute(rusqlite::params_from_iter(to_sqlite_params(params)))?;
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(rows as u64)
}

fn execute_batch_on_conn(conn: &rusqlite::Connection, sql: &str) -> Result<(), BackendError> {
    let span = debug_span!(
        "db.exec_batch",
        op = "BATCH",
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();
    conn.execute_batch(sql)?;
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(())
}

fn query_on_conn(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<Vec<DbRow>, BackendError> {
    let span = debug_span!(
        "db.query",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>()
        .into();
    let column_count = columns.len();

    let mut rows = stmt.query(rusqlite::params_from_iter(to_sqlite_params(params)))?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(sqlite_value_to_db_value(row.get_ref(i)?));
        }
        result.push(DbRow::new(Arc::clone(&columns), values));
    }

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(result)
}

fn to_sqlite_params(params: &[DbValue]) -> Vec<rusqlite::types::Value> {
    use rusqlite::types::Value;

    params
        .iter()
        .map(|p| match p {
            DbValue::Null => Value::Null,
            DbValue::Integer(v) => Value::Integer(*v),
            DbValue::Real(v) => Value::Real(*v),
            DbValue::Text(v) => Value::Text(v.clone()),
            DbValue::Blob(v) => Value::Blob(v.clone()),
            DbValue::Boolean(v) => Value::Integer(i64::from(*v)),
            DbValue::Timestamp(v) => Value::Text(v.to_rfc3339()),
        })
        .collect()
}

fn sqlite_value_to_db_value(value: rusqlite::types::ValueRef<'_>) -> DbValue {
    use rusqlite::types::ValueRef;

    match value {
        ValueRef::Null => DbValue::Null,
        ValueRef::Integer(v) => DbValue::Integer(v),
        ValueRef::Real(v) => DbValue::Real(v),
        ValueRef::Text(v) => DbValue::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => DbValue::Blob(v.to_vec()),
    }
}

const DEFAULT_MAX_PARAMS: usize = 999;

fn bulk_insert_rows_internal<F>(
    mut execute: F,
    table: &str,
    columns: &[&str],
    rows: &[Vec<DbValue>],
) -> Result<u64, BackendError>
where
    F: FnMut(&str, &[DbValue]) -> Result<u64, BackendError>,
{
    if rows.is_empty() {
        return Ok(0);
    }
    if columns.is_empty() {
        return Err(BackendError::InvalidInput(
            "bulk_insert_rows requires at least one column".to_string(),
        ));
    }

    for (index, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(BackendError::InvalidInput(format!(
                "Row {} has {} values, expected {}",
                index,
                row.len(),
                columns.len()
            )));
        }
    }

    let cols_len = columns.len();
    if cols_len > DEFAULT_MAX_PARAMS {
        return Err(BackendError::InvalidInput(format!(
            "Too many columns ({}) for max params ({})",
            cols_len, DEFAULT_MAX_PARAMS
        )));
    }
    let rows_per_chunk = DEFAULT_MAX_PARAMS / cols_len;

    let quoted_table = quote_ident_path(table);
    let quoted_cols = columns
        .iter()
        .map(|col| quote_ident(col))
        .collect::<Vec<_>>()
        .join(", ");
    let row_clause = format!("({})", vec!["?"; cols_len].join(", "));

    let mut total = 0;
    for chunk in rows.chunks(rows_per_chunk) {
        let values_clause = std::iter::repeat(row_clause.as_str())
            .take(chunk.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quoted_table, quoted_cols, values_clause
        );
        let params: Vec<DbValue> = chunk.iter().flatten().cloned().collect();
        execute(&sql, &params)?;
        total += chunk.len() as u64;
    }

    Ok(total)
}

fn quote_ident(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len() + 2);
    escaped.push('"');
    for ch in name.chars() {
        if ch == '"' {
            escaped.push('"');
        }
        escaped.push(ch);
    }
    escaped.push('"');
    escaped
}

fn quote_ident_path(path: &str) -> String {
    path.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Build a `?, ?, ?` placeholder list for an `IN (...)` clause.
pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn sql_op_name(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("unknown")
}

fn hash_sql(sql: &str) -> String {
    // FNV-1a 64-bit hash for low-cardinality, stable identification.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in sql.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_insert_rows_inserts_expected_rows() {
        let conn = DbConnection::open_sqlite_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER, name TEXT)")
            .unwrap();

        let rows = vec![
            vec![DbValue::from(1_i64), DbValue::from("alpha")],
            vec![DbValue::from(2_i64), DbValue::from("beta")],
        ];
        let inserted = conn.bulk_insert_rows("t", &["id", "name"], &rows).unwrap();

        assert_eq!(inserted, 2);
        let count: i64 = conn.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn bulk_insert_rows_rejects_mismatched_row_len() {
        let conn = DbConnection::open_sqlite_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER, name TEXT)")
            .unwrap();

        let rows = vec![
            vec![DbValue::from(1_i64)],
            vec![DbValue::from(2_i64), DbValue::from("beta")],
        ];
        let err = conn
            .bulk_insert_rows("t", &["id", "name"], &rows)
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let conn = DbConnection::open_sqlite_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .unwrap();

        let result: Result<(), BackendError> = conn.transaction(|tx| {
            tx.execute("INSERT INTO t (id) VALUES (?)", &[DbValue::from(1_i64)])?;
            Err(BackendError::InvalidInput("abort".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = conn.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn rows_expose_values_by_name() {
        let conn = DbConnection::open_sqlite_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER, label TEXT, flag INTEGER);
             INSERT INTO t VALUES (7, NULL, 1);",
        )
        .unwrap();

        let row = conn
            .query_optional("SELECT id, label, flag FROM t", &[])
            .unwrap()
            .unwrap();
        assert_eq!(row.get_by_name::<i64>("id").unwrap(), 7);
        assert_eq!(row.get_by_name::<Option<String>>("label").unwrap(), None);
        assert!(row.get_by_name::<bool>("flag").unwrap());
        assert!(row.get_by_name::<i64>("missing").is_err());
    }

    #[test]
    fn failed_commit_leaves_connection_usable() {
        let conn = DbConnection::open_sqlite_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (
                 id INTEGER PRIMARY KEY,
                 parent_id INTEGER REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED
             );",
        )
        .unwrap();

        // The deferred foreign key is only checked at COMMIT.
        let result = conn.transaction(|tx| {
            tx.execute(
                "INSERT INTO child (id, parent_id) VALUES (?, ?)",
                &[DbValue::from(1_i64), DbValue::from(42_i64)],
            )
        });
        assert!(result.is_err());

        conn.transaction(|tx| {
            tx.execute("INSERT INTO parent (id) VALUES (?)", &[DbValue::from(42_i64)])?;
            tx.execute(
                "INSERT INTO child (id, parent_id) VALUES (?, ?)",
                &[DbValue::from(2_i64), DbValue::from(42_i64)],
            )
        })
        .unwrap();
        let ids: Vec<i64> = conn
            .query_all("SELECT id FROM child ORDER BY id", &[])
            .unwrap()
            .iter()
            .map(|row| row.get(0).unwrap())
            .collect();
        assert_eq!(ids, vec![2]);
    }
}
