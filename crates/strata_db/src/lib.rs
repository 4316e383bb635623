//! Database layer for Strata.
//!
//! A synchronous SQLite connection with typed parameter and row values,
//! closure-scoped transactions, and process-level file locks.
//!
//! # Usage
//!
//! ```rust,ignore
//! use strata_db::{DbConnection, DbValue};
//!
//! let conn = DbConnection::open_sqlite(Path::new("lineage.sqlite"))?;
//! conn.transaction(|tx| {
//!     tx.execute("INSERT INTO t (name) VALUES (?)", &[DbValue::from("a")])?;
//!     Ok(())
//! })?;
//! ```

pub mod backend;
pub mod lock;

pub use backend::{
    placeholders, BackendError, DbConnection, DbRow, DbTimestamp, DbTimestampError,
    DbTransaction, DbValue, FromDbValue,
};
pub use lock::{lock_exclusive, LockError, LockGuard};
