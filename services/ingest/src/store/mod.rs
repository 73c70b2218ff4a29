//! Database access behind two narrow traits, one per load phase.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use std::fmt;

use crate::error::StoreError;
use crate::record::FactRow;

/// Reference (dimension) tables deduplicated by normalized name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Department,
    ServiceStation,
}

impl EntityKind {
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Department => "departments",
            EntityKind::ServiceStation => "service_stations",
        }
    }

    /// Only service stations carry a region
    pub fn has_region(self) -> bool {
        matches!(self, EntityKind::ServiceStation)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// A persisted reference entity
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredEntity {
    pub id: i32,
    pub name: String,
}

/// Lookup and insert for reference entities
pub trait ReferenceStore {
    /// Entities whose stored name equals one of `names` exactly, or whose
    /// normalized name is one of `normalized`.
    async fn find_entities(
        &mut self,
        kind: EntityKind,
        names: &[String],
        normalized: &[String],
    ) -> Result<Vec<StoredEntity>, StoreError>;

    /// Insert one entity and return its id. A uniqueness violation is
    /// reported as [`StoreError::Conflict`].
    async fn insert_entity(
        &mut self,
        kind: EntityKind,
        name: &str,
        region: Option<&str>,
    ) -> Result<i32, StoreError>;

    /// Drop the current session and open a fresh one
    async fn reconnect(&mut self) -> Result<(), StoreError>;
}

/// Insert target for fact rows
pub trait FactSink {
    /// Insert all rows with one statement in one transaction. Either every
    /// row commits or none does.
    async fn insert_chunk(&mut self, rows: &[FactRow]) -> Result<u64, StoreError>;

    /// Insert rows one at a time in one transaction, isolating each row so
    /// a rejected row does not undo its siblings. The outer error is for
    /// failures that lose the whole chunk (connection, commit).
    async fn insert_each(
        &mut self,
        rows: &[FactRow],
    ) -> Result<Vec<Result<(), StoreError>>, StoreError>;

    async fn reconnect(&mut self) -> Result<(), StoreError>;
}

/// SQLSTATE classes and codes treated as transient connectivity problems
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "53300" | "57P01" | "57P02" | "57P03")
}

/// The driver refuses a statement with more bind parameters than the
/// protocol can carry before anything is sent; the session stays usable.
fn is_oversized_statement(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Protocol(msg) if msg.contains("too many arguments"))
}

/// True for errors worth retrying after a pause or reconnect
pub fn is_transient(err: &sqlx::Error) -> bool {
    if is_oversized_statement(err) {
        return false;
    }
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|c| is_transient_sqlstate(&c)),
        _ => false,
    }
}

/// Sort a sqlx error into the pipeline's error taxonomy
pub fn classify(err: sqlx::Error) -> StoreError {
    if is_transient(&err) {
        return StoreError::Connection(err);
    }
    if is_oversized_statement(&err) {
        return StoreError::Rejected(err.to_string());
    }
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict(db.message().to_string());
        }
        let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
        // insufficient_privilege, undefined_table, undefined_column, auth
        if matches!(code.as_str(), "42501" | "42P01" | "42703") || code.starts_with("28") {
            return StoreError::Fatal(err);
        }
        return StoreError::Rejected(db.message().to_string());
    }
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Rejected(err.to_string())
        }
        other => StoreError::Fatal(other),
    }
}
