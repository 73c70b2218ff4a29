//! Bulk get-or-create for reference entities.
//!
//! Lookup, insert what is missing, then look up again. A uniqueness
//! conflict on insert means another writer created the same name first;
//! the second lookup picks up its id. Running the same resolve twice
//! creates nothing the second time.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::normalize::normalize;
use crate::store::{EntityKind, ReferenceStore, StoredEntity};

/// A name as it appears in the sheet, with the region seen next to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRequest {
    pub name: String,
    pub region: Option<String>,
}

impl NameRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: None,
        }
    }

    pub fn with_region(name: impl Into<String>, region: Option<String>) -> Self {
        Self {
            name: name.into(),
            region,
        }
    }
}

/// All surface forms of one normalized name
#[derive(Debug)]
struct Wanted {
    /// First-seen surface form; becomes the stored name on insert
    display: String,
    region: Option<String>,
    raw_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolveStats {
    /// Distinct normalized names requested
    pub requested: usize,
    pub created: usize,
    pub conflicts: usize,
    pub unresolved: usize,
}

#[derive(Debug, Default)]
pub struct Resolution {
    /// Raw (trimmed) name -> entity id
    pub ids: HashMap<String, i32>,
    pub stats: ResolveStats,
}

impl Resolution {
    pub fn id_for(&self, raw: &str) -> Option<i32> {
        self.ids.get(raw.trim()).copied()
    }
}

fn collect_wanted(requests: &[NameRequest]) -> IndexMap<String, Wanted> {
    let mut wanted: IndexMap<String, Wanted> = IndexMap::new();
    for request in requests {
        let raw = request.name.trim();
        let Some(key) = normalize(raw) else {
            continue;
        };
        let entry = wanted.entry(key).or_insert_with(|| Wanted {
            display: raw.to_string(),
            region: None,
            raw_names: Vec::new(),
        });
        if entry.region.is_none() {
            entry.region = request.region.clone();
        }
        if !entry.raw_names.iter().any(|n| n == raw) {
            entry.raw_names.push(raw.to_string());
        }
    }
    wanted
}

/// Map normalized name -> id. When several stored rows normalize equal
/// (possible without a normalized unique index) the oldest id wins.
fn index_by_normalized(found: Vec<StoredEntity>) -> HashMap<String, i32> {
    let mut by_key: HashMap<String, i32> = HashMap::new();
    for entity in found {
        if let Some(key) = normalize(&entity.name) {
            by_key
                .entry(key)
                .and_modify(|id| *id = (*id).min(entity.id))
                .or_insert(entity.id);
        }
    }
    by_key
}

async fn lookup<S: ReferenceStore>(
    store: &mut S,
    kind: EntityKind,
    wanted: &IndexMap<String, Wanted>,
) -> Result<HashMap<String, i32>, StoreError> {
    let raw: Vec<String> = wanted
        .values()
        .flat_map(|w| w.raw_names.iter().cloned())
        .collect();
    let keys: Vec<String> = wanted.keys().cloned().collect();
    let found = store.find_entities(kind, &raw, &keys).await?;
    Ok(index_by_normalized(found))
}

async fn resolve_once<S: ReferenceStore>(
    store: &mut S,
    kind: EntityKind,
    wanted: &IndexMap<String, Wanted>,
) -> Result<Resolution, StoreError> {
    let mut stats = ResolveStats {
        requested: wanted.len(),
        ..ResolveStats::default()
    };

    let mut known = lookup(store, kind, wanted).await?;

    let missing: Vec<&Wanted> = wanted
        .iter()
        .filter(|(key, _)| !known.contains_key(*key))
        .map(|(_, w)| w)
        .collect();

    if !missing.is_empty() {
        for w in &missing {
            let region = if kind.has_region() { w.region.as_deref() } else { None };
            match store.insert_entity(kind, &w.display, region).await {
                Ok(id) => {
                    debug!(table = %kind, name = %w.display, id, "entity created");
                    stats.created += 1;
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(table = %kind, name = %w.display, %reason, "entity created concurrently");
                    stats.conflicts += 1;
                }
                Err(e) if e.is_connection() => return Err(e),
                Err(StoreError::Fatal(e)) => return Err(StoreError::Fatal(e)),
                Err(e) => {
                    warn!(table = %kind, name = %w.display, error = %e, "entity insert failed");
                }
            }
        }
        // Authoritative ids, including rows another writer inserted meanwhile
        known = lookup(store, kind, wanted).await?;
    }

    let mut ids = HashMap::new();
    for (key, w) in wanted {
        match known.get(key) {
            Some(&id) => {
                for raw in &w.raw_names {
                    ids.insert(raw.clone(), id);
                }
            }
            None => {
                warn!(table = %kind, name = %w.display, "name could not be resolved");
                stats.unresolved += 1;
            }
        }
    }

    Ok(Resolution { ids, stats })
}

/// Resolve names to ids for one reference table, creating missing
/// entities. Names that still cannot be resolved are left out of the
/// result; callers treat absence as a null foreign key.
///
/// A connection failure reconnects once and redoes the whole resolve,
/// which is safe because every step is idempotent.
pub async fn resolve<S: ReferenceStore>(
    store: &mut S,
    kind: EntityKind,
    requests: &[NameRequest],
) -> Result<Resolution, StoreError> {
    let wanted = collect_wanted(requests);
    if wanted.is_empty() {
        return Ok(Resolution::default());
    }

    let resolution = match resolve_once(store, kind, &wanted).await {
        Err(e) if e.is_connection() => {
            warn!(table = %kind, error = %e, "connection lost while resolving, reconnecting");
            store.reconnect().await?;
            resolve_once(store, kind, &wanted).await?
        }
        other => other?,
    };

    info!(
        table = %kind,
        requested = resolution.stats.requested,
        created = resolution.stats.created,
        conflicts = resolution.stats.conflicts,
        unresolved = resolution.stats.unresolved,
        "reference names resolved"
    );
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn names(list: &[&str]) -> Vec<NameRequest> {
        list.iter().map(|n| NameRequest::new(*n)).collect()
    }

    #[tokio::test]
    async fn test_empty_input_touches_nothing() {
        let mut store = MemoryStore::new();
        let res = resolve(&mut store, EntityKind::Department, &names(&["", "  ", "--"]))
            .await
            .unwrap();
        assert!(res.ids.is_empty());
        assert_eq!(store.insert_calls, 0);
    }

    #[tokio::test]
    async fn test_creates_one_entity_per_normalized_name() {
        let mut store = MemoryStore::new();
        let res = resolve(&mut store, EntityKind::Department, &names(&["Ops", "ops", "OPS "]))
            .await
            .unwrap();

        let rows = store.rows(EntityKind::Department);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Ops");
        assert_eq!(res.stats.created, 1);
        assert_eq!(res.id_for("Ops"), Some(rows[0].id));
        assert_eq!(res.id_for("ops"), Some(rows[0].id));
        assert_eq!(res.id_for("OPS "), Some(rows[0].id));
    }

    #[tokio::test]
    async fn test_second_run_creates_nothing() {
        let mut store = MemoryStore::new();
        let input = names(&["Ops", "Finance", "Nairobi HQ"]);

        let first = resolve(&mut store, EntityKind::Department, &input).await.unwrap();
        let calls_after_first = store.insert_calls;
        let second = resolve(&mut store, EntityKind::Department, &input).await.unwrap();

        assert_eq!(first.ids, second.ids);
        assert_eq!(second.stats.created, 0);
        assert_eq!(store.insert_calls, calls_after_first);
        assert_eq!(store.rows(EntityKind::Department).len(), 3);
    }

    #[tokio::test]
    async fn test_matches_existing_by_normalized_form() {
        let mut store = MemoryStore::new().with_entity(EntityKind::Department, "NAIROBI HQ");
        let existing = store.rows(EntityKind::Department)[0].id;

        let res = resolve(&mut store, EntityKind::Department, &names(&["nairobi-hq"]))
            .await
            .unwrap();

        assert_eq!(res.id_for("nairobi-hq"), Some(existing));
        assert_eq!(res.stats.created, 0);
        assert_eq!(store.insert_calls, 0);
    }

    #[tokio::test]
    async fn test_concurrent_writer_conflict_converges() {
        // Another resolver inserts "nairobi-hq" between our lookup and insert
        let mut store = MemoryStore::new();
        store.rival_insert = Some((EntityKind::Department, "nairobi-hq".to_string()));

        let ours = resolve(&mut store, EntityKind::Department, &names(&["Nairobi  HQ"]))
            .await
            .unwrap();
        assert_eq!(ours.stats.created, 0);
        assert_eq!(ours.stats.conflicts, 1);

        let rows = store.rows(EntityKind::Department);
        assert_eq!(rows.len(), 1);
        let rival_id = rows[0].id;
        assert_eq!(ours.id_for("Nairobi  HQ"), Some(rival_id));

        // The rival's own resolve converges on the same id
        let theirs = resolve(&mut store, EntityKind::Department, &names(&["nairobi-hq"]))
            .await
            .unwrap();
        assert_eq!(theirs.id_for("nairobi-hq"), Some(rival_id));
        assert_eq!(store.rows(EntityKind::Department).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_insert_is_omitted_not_fatal() {
        let mut store = MemoryStore::new();
        store.broken_names.push("Bad".to_string());

        let res = resolve(&mut store, EntityKind::Department, &names(&["Good", "Bad"]))
            .await
            .unwrap();

        assert!(res.id_for("Good").is_some());
        assert_eq!(res.id_for("Bad"), None);
        assert_eq!(res.stats.unresolved, 1);
        assert_eq!(res.stats.created, 1);
    }

    #[tokio::test]
    async fn test_connection_loss_after_inserts_redoes_without_duplicates() {
        // The re-lookup after inserting loses the connection
        let mut store = MemoryStore::new();
        store.drop_connection_on_find = vec![1];

        let res = resolve(&mut store, EntityKind::Department, &names(&["Ops", "ops", "Finance"]))
            .await
            .unwrap();

        assert_eq!(store.reconnects, 1);
        assert_eq!(store.rows(EntityKind::Department).len(), 2);
        assert_eq!(res.stats.created, 0);
        assert_eq!(res.stats.unresolved, 0);
        assert_eq!(res.id_for("Ops"), res.id_for("ops"));
        assert!(res.id_for("Ops").is_some());
        assert!(res.id_for("Finance").is_some());
    }

    #[tokio::test]
    async fn test_second_connection_loss_is_returned() {
        let mut store = MemoryStore::new();
        store.drop_connection_on_find = vec![0, 1];

        let err = resolve(&mut store, EntityKind::Department, &names(&["Ops"]))
            .await
            .unwrap_err();

        assert!(err.is_connection());
        assert_eq!(store.reconnects, 1);
        assert_eq!(store.insert_calls, 0);
    }

    #[tokio::test]
    async fn test_station_region_first_seen_wins() {
        let mut store = MemoryStore::new();
        let requests = vec![
            NameRequest::with_region("Kisumu Depot", None),
            NameRequest::with_region("kisumu depot", Some("Western".to_string())),
            NameRequest::with_region("KISUMU DEPOT", Some("Nyanza".to_string())),
        ];

        resolve(&mut store, EntityKind::ServiceStation, &requests)
            .await
            .unwrap();

        let rows = store.rows(EntityKind::ServiceStation);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Kisumu Depot");
        assert_eq!(rows[0].region.as_deref(), Some("Western"));
    }

    #[test]
    fn test_oldest_id_wins_among_duplicates() {
        let found = vec![
            StoredEntity { id: 9, name: "ops".to_string() },
            StoredEntity { id: 4, name: "OPS".to_string() },
        ];
        let index = index_by_normalized(found);
        assert_eq!(index.get("OPS"), Some(&4));
    }
}
