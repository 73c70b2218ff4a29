//! In-memory store with the same constraints as the Postgres schema:
//! normalized-name uniqueness per reference table and foreign keys on facts.

use std::collections::BTreeMap;
use std::io;

use crate::error::StoreError;
use crate::normalize::normalize;
use crate::record::FactRow;

use super::{classify, EntityKind, FactSink, ReferenceStore, StoredEntity};

#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: i32,
    pub name: String,
    pub region: Option<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub entities: BTreeMap<EntityKind, Vec<EntityRow>>,
    pub facts: Vec<FactRow>,
    next_id: i32,
    /// Inserted just before the next `insert_entity` call, as if another
    /// process won the race for that name.
    pub rival_insert: Option<(EntityKind, String)>,
    /// Names whose insert fails with a non-conflict error
    pub broken_names: Vec<String>,
    /// 0-based chunk indexes whose `insert_chunk` loses the connection
    pub drop_connection_on_chunks: Vec<usize>,
    /// 0-based `insert_each` call indexes that lose the connection
    pub drop_connection_on_each: Vec<usize>,
    /// 0-based `find_entities` call indexes that lose the connection
    pub drop_connection_on_find: Vec<usize>,
    /// Larger chunks fail the way the driver refuses too many bind parameters
    pub max_chunk_rows: Option<usize>,
    pub refuse_reconnect: bool,
    pub find_calls: usize,
    pub chunk_calls: usize,
    pub each_calls: usize,
    pub reconnects: usize,
    pub insert_calls: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, kind: EntityKind, name: &str) -> Self {
        self.push_entity(kind, name, None);
        self
    }

    pub fn rows(&self, kind: EntityKind) -> &[EntityRow] {
        self.entities.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    fn push_entity(&mut self, kind: EntityKind, name: &str, region: Option<&str>) -> i32 {
        self.next_id += 1;
        let id = self.next_id;
        self.entities.entry(kind).or_default().push(EntityRow {
            id,
            name: name.to_string(),
            region: region.map(str::to_string),
        });
        id
    }

    fn exists(&self, kind: EntityKind, id: Option<i32>) -> bool {
        match id {
            None => true,
            Some(id) => self.rows(kind).iter().any(|r| r.id == id),
        }
    }

    fn check_row(&self, row: &FactRow) -> Result<(), StoreError> {
        if !self.exists(EntityKind::Department, row.department_id) {
            return Err(StoreError::Rejected(format!(
                "insert violates foreign key constraint on department_id {:?}",
                row.department_id
            )));
        }
        if !self.exists(EntityKind::ServiceStation, row.service_station_id) {
            return Err(StoreError::Rejected(format!(
                "insert violates foreign key constraint on service_station_id {:?}",
                row.service_station_id
            )));
        }
        Ok(())
    }

    fn connection_lost() -> StoreError {
        StoreError::Connection(sqlx::Error::Io(io::Error::from(
            io::ErrorKind::ConnectionReset,
        )))
    }
}

impl ReferenceStore for MemoryStore {
    async fn find_entities(
        &mut self,
        kind: EntityKind,
        names: &[String],
        normalized: &[String],
    ) -> Result<Vec<StoredEntity>, StoreError> {
        let call = self.find_calls;
        self.find_calls += 1;
        if self.drop_connection_on_find.contains(&call) {
            return Err(Self::connection_lost());
        }
        Ok(self
            .rows(kind)
            .iter()
            .filter(|r| {
                names.contains(&r.name)
                    || normalize(&r.name).is_some_and(|n| normalized.contains(&n))
            })
            .map(|r| StoredEntity {
                id: r.id,
                name: r.name.clone(),
            })
            .collect())
    }

    async fn insert_entity(
        &mut self,
        kind: EntityKind,
        name: &str,
        region: Option<&str>,
    ) -> Result<i32, StoreError> {
        self.insert_calls += 1;
        if let Some((rival_kind, rival_name)) = self.rival_insert.take() {
            self.push_entity(rival_kind, &rival_name, None);
        }
        if self.broken_names.iter().any(|b| b == name) {
            return Err(StoreError::Rejected(format!("value too long for {name}")));
        }
        let key = normalize(name);
        if self.rows(kind).iter().any(|r| normalize(&r.name) == key) {
            return Err(StoreError::Conflict(format!(
                "duplicate key value violates unique constraint on {kind}"
            )));
        }
        Ok(self.push_entity(kind, name, region))
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        self.reconnects += 1;
        if self.refuse_reconnect {
            return Err(Self::connection_lost());
        }
        Ok(())
    }
}

impl FactSink for MemoryStore {
    async fn insert_chunk(&mut self, rows: &[FactRow]) -> Result<u64, StoreError> {
        let call = self.chunk_calls;
        self.chunk_calls += 1;
        if self.drop_connection_on_chunks.contains(&call) {
            return Err(Self::connection_lost());
        }
        if self.max_chunk_rows.is_some_and(|max| rows.len() > max) {
            return Err(classify(sqlx::Error::Protocol(format!(
                "PgConnection::run(): too many arguments for query: {}",
                rows.len() * FactRow::COLUMNS
            ))));
        }
        for row in rows {
            self.check_row(row)?;
        }
        self.facts.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn insert_each(
        &mut self,
        rows: &[FactRow],
    ) -> Result<Vec<Result<(), StoreError>>, StoreError> {
        let call = self.each_calls;
        self.each_calls += 1;
        if self.drop_connection_on_each.contains(&call) {
            return Err(Self::connection_lost());
        }
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let outcome = self.check_row(row);
            if outcome.is_ok() {
                self.facts.push(row.clone());
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        ReferenceStore::reconnect(self).await
    }
}
