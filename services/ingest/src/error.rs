use std::path::PathBuf;

use thiserror::Error;

use crate::retry::RetryError;

/// Failure to turn the input file into raw rows
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported input format '{0}' (expected xlsx, xlsm, xls, xlsb, ods or csv)")]
    UnsupportedFormat(String),
    #[error("failed to open workbook {path}: {source}")]
    Workbook {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },
    #[error("workbook has no sheets")]
    NoSheets,
    #[error("sheet '{0}' not found")]
    SheetNotFound(String),
    #[error("sheet '{0}' has no header row")]
    NoHeader(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} env var missing")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown canonical field '{0}'")]
    UnknownField(String),
}

/// Required canonical fields with no matching source column
#[derive(Debug, Error)]
#[error("missing required columns {missing:?}; found headers {found:?}")]
pub struct MappingError {
    pub missing: Vec<&'static str>,
    pub found: Vec<String>,
}

/// Database failures, classified by how the pipeline reacts to them
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity lost or unavailable; retried via reconnect
    #[error("connection error: {0}")]
    Connection(#[source] sqlx::Error),
    /// Uniqueness violation, expected when another writer got there first
    #[error("conflict: {0}")]
    Conflict(String),
    /// Row-level data error (constraint violation, bad value)
    #[error("rejected: {0}")]
    Rejected(String),
    /// Schema or permission problem; aborts the run
    #[error("fatal database error: {0}")]
    Fatal(#[source] sqlx::Error),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not connect to database: {0}")]
    Unreachable(#[source] RetryError<sqlx::Error>),
    #[error("required table '{0}' does not exist")]
    MissingTable(&'static str),
}
