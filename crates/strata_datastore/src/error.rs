//! Error types for the datastore layer

use crate::copy::CopyMode;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Datastore error type
#[derive(Error, Debug)]
pub enum DatastoreError {
    #[error("Invalid file category '{category}': {message}")]
    Config { category: String, message: String },

    #[error("Invalid regex '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{}", .mode.failure_message(.src, .dest))]
    Copy {
        mode: CopyMode,
        src: PathBuf,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Source file {0} does not exist")]
    MissingSource(PathBuf),

    #[error("Unable to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Lineage error: {0}")]
    Lineage(#[from] strata_db::BackendError),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(String),

    #[error("Unable to truncate regex {regex} to level {level}")]
    Truncation { regex: String, level: i64 },

    #[error("Unknown file category: {0}")]
    UnknownCategory(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Lock error: {0}")]
    Lock(#[from] strata_db::LockError),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl DatastoreError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        DatastoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(category: impl Into<String>, message: impl Into<String>) -> Self {
        DatastoreError::Config {
            category: category.into(),
            message: message.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, DatastoreError>;
