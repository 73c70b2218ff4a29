//! One ingest run end to end: read, map, convert, resolve, enrich, load.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::columns::{AliasTable, ColumnMapping};
use crate::config::Config;
use crate::convert::{convert_rows, ConversionStats};
use crate::enrich::{department_requests, enrich, station_requests, UnresolvedCounts};
use crate::error::{MappingError, StoreError};
use crate::loader::{load, LoadOptions, LoadReport};
use crate::normalize::normalize;
use crate::record::{Field, FuelRecord};
use crate::resolver::{resolve, NameRequest, ResolveStats};
use crate::source::{content_hash, read_sheet, Sheet};
use crate::store::postgres::{Connector, PgStore};
use crate::store::{EntityKind, FactSink, ReferenceStore};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub path: PathBuf,
    pub sheet: Option<String>,
    pub aliases: AliasTable,
    pub dry_run: bool,
}

/// Records ready for the database, plus what mapping and conversion had to drop
#[derive(Debug)]
pub struct Prepared {
    pub records: Vec<FuelRecord>,
    pub stats: ConversionStats,
    /// Canonical field -> source header
    pub columns: BTreeMap<&'static str, String>,
    pub unmapped: Vec<&'static str>,
}

/// Database-side results of a run
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub departments: ResolveStats,
    pub service_stations: ResolveStats,
    pub unresolved: UnresolvedCounts,
    pub load: LoadReport,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub content_hash: String,
    pub sheet: String,
    pub dry_run: bool,
    pub rows_read: usize,
    pub blank_rows_skipped: usize,
    pub records_converted: usize,
    pub columns: BTreeMap<&'static str, String>,
    pub unmapped_fields: Vec<&'static str>,
    pub conversion: ConversionStats,
    pub departments: ResolveStats,
    pub service_stations: ResolveStats,
    pub unresolved_rows: UnresolvedCounts,
    pub load: LoadReport,
    pub elapsed_secs: f64,
    pub rows_per_sec: f64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Fuel Transaction Ingest ===")?;
        writeln!(f, "Run ID: {}", self.run_id)?;
        writeln!(f, "Source: {}", self.source)?;
        writeln!(f, "Hash: {}", self.content_hash)?;
        writeln!(f, "Sheet: {}", self.sheet)?;
        writeln!(f, "Mode: {}", if self.dry_run { "dry-run" } else { "live" })?;
        writeln!(
            f,
            "Rows read: {} (blank rows skipped: {})",
            self.rows_read, self.blank_rows_skipped
        )?;
        writeln!(f, "Column mapping:")?;
        for (field, header) in &self.columns {
            writeln!(f, "  {field:<22} <- {header}")?;
        }
        if !self.unmapped_fields.is_empty() {
            writeln!(f, "Unmapped fields: {}", self.unmapped_fields.join(", "))?;
        }
        writeln!(f, "Values stored as null: {}", self.conversion.total_rejected())?;
        for (field, count) in &self.conversion.rejected {
            writeln!(f, "  {field}: {count}")?;
        }
        for (field, count) in &self.conversion.truncated {
            writeln!(f, "Truncated {field}: {count}")?;
        }
        for (label, stats) in [
            ("Departments", &self.departments),
            ("Service stations", &self.service_stations),
        ] {
            writeln!(
                f,
                "{label}: {} distinct, {} created, {} conflicts, {} unresolved",
                stats.requested, stats.created, stats.conflicts, stats.unresolved
            )?;
        }
        if self.unresolved_rows.departments + self.unresolved_rows.service_stations > 0 {
            writeln!(
                f,
                "Rows with null foreign key: department {}, service station {}",
                self.unresolved_rows.departments, self.unresolved_rows.service_stations
            )?;
        }
        if !self.dry_run {
            writeln!(f, "Inserted: {}", self.load.inserted)?;
            writeln!(f, "Failed: {}", self.load.failed)?;
            writeln!(
                f,
                "Chunks: {} (fallback: {}, reconnects: {})",
                self.load.chunks, self.load.fallback_chunks, self.load.reconnects
            )?;
        }
        write!(
            f,
            "Elapsed: {:.2}s ({:.1} rows/s)",
            self.elapsed_secs, self.rows_per_sec
        )
    }
}

/// Map and convert a sheet. Fails before any database work when a
/// required field has no source column.
pub fn prepare(sheet: &Sheet, aliases: &AliasTable, config: &Config) -> Result<Prepared, MappingError> {
    let mapping = ColumnMapping::from_headers(&sheet.headers, aliases);
    mapping.check_required(&config.required, &sheet.headers)?;
    mapping.report_missing();

    let columns = Field::ALL
        .iter()
        .filter_map(|f| mapping.header_for(*f).map(|h| (f.name(), h.to_string())))
        .collect();
    let unmapped = mapping.missing().iter().map(|f| f.name()).collect();

    let (records, stats) = convert_rows(&sheet.rows, &mapping, &config.rules);
    stats.report();
    info!(records = records.len(), rejected = stats.total_rejected(), "rows converted");

    Ok(Prepared {
        records,
        stats,
        columns,
        unmapped,
    })
}

/// Resolve reference entities, then load fact rows
pub async fn load_records<S>(
    store: &mut S,
    records: Vec<FuelRecord>,
    options: &LoadOptions,
) -> Result<LoadOutcome, StoreError>
where
    S: ReferenceStore + FactSink,
{
    let departments = resolve(store, EntityKind::Department, &department_requests(&records)).await?;
    let stations = resolve(store, EntityKind::ServiceStation, &station_requests(&records)).await?;

    let enriched = enrich(records, &departments, &stations);
    let report = load(store, &enriched.rows, options).await?;

    Ok(LoadOutcome {
        departments: departments.stats,
        service_stations: stations.stats,
        unresolved: enriched.unresolved,
        load: report,
    })
}

fn distinct(requests: &[NameRequest]) -> usize {
    requests
        .iter()
        .filter_map(|r| normalize(&r.name))
        .collect::<HashSet<_>>()
        .len()
}

/// Names a dry run would send to the resolver
fn dry_run_outcome(records: &[FuelRecord]) -> LoadOutcome {
    LoadOutcome {
        departments: ResolveStats {
            requested: distinct(&department_requests(records)),
            ..ResolveStats::default()
        },
        service_stations: ResolveStats {
            requested: distinct(&station_requests(records)),
            ..ResolveStats::default()
        },
        ..LoadOutcome::default()
    }
}

async fn load_postgres(config: &Config, records: Vec<FuelRecord>) -> Result<LoadOutcome> {
    let connector = Connector::new(config.connect_options()?, config.retry);
    let mut store = PgStore::open(connector).await?;
    if let Err(e) = store.verify_schema().await {
        store.close().await;
        return Err(e).context("database schema check failed");
    }

    let outcome = load_records(&mut store, records, &config.load).await;
    store.close().await;
    Ok(outcome?)
}

async fn execute(run_id: Uuid, config: &Config, options: &RunOptions) -> Result<RunSummary> {
    let started = Instant::now();
    let path = &options.path;
    info!(source = %path.display(), dry_run = options.dry_run, "ingest started");

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let hash = content_hash(&bytes);
    let sheet = read_sheet(path, &bytes, options.sheet.as_deref())
        .with_context(|| format!("failed to parse {}", path.display()))?;
    drop(bytes);
    info!(
        sheet = %sheet.name,
        columns = sheet.headers.len(),
        rows = sheet.rows.len(),
        "sheet loaded"
    );

    let Prepared {
        records,
        stats,
        columns,
        unmapped,
    } = prepare(&sheet, &options.aliases, config)?;
    let records_converted = records.len();

    let outcome = if options.dry_run {
        dry_run_outcome(&records)
    } else {
        load_postgres(config, records).await?
    };

    let elapsed = started.elapsed().as_secs_f64();
    let processed = if options.dry_run {
        records_converted as f64
    } else {
        outcome.load.inserted as f64
    };
    let rows_per_sec = if elapsed > 0.0 { processed / elapsed } else { 0.0 };

    info!(
        inserted = outcome.load.inserted,
        failed = outcome.load.failed,
        elapsed_secs = elapsed,
        "ingest finished"
    );

    Ok(RunSummary {
        run_id,
        source: path.display().to_string(),
        content_hash: hash,
        sheet: sheet.name,
        dry_run: options.dry_run,
        rows_read: sheet.rows.len(),
        blank_rows_skipped: sheet.blank_rows,
        records_converted,
        columns,
        unmapped_fields: unmapped,
        conversion: stats,
        departments: outcome.departments,
        service_stations: outcome.service_stations,
        unresolved_rows: outcome.unresolved,
        load: outcome.load,
        elapsed_secs: elapsed,
        rows_per_sec,
    })
}

/// Run one ingest inside an `ingest` span tagged with a fresh run id
pub async fn run(config: &Config, options: &RunOptions) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let span = info_span!("ingest", %run_id);
    execute(run_id, config, options).instrument(span).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{read_csv, Cell, RawRow};
    use crate::store::memory::MemoryStore;
    use indexmap::IndexMap;
    use std::time::Duration;

    fn config() -> Config {
        Config::from_lookup(|_| None).unwrap()
    }

    fn options() -> LoadOptions {
        LoadOptions {
            chunk_size: 2,
            pause: Duration::ZERO,
        }
    }

    fn row(department: &str, station: &str, quantity: &str) -> RawRow {
        let mut row: RawRow = IndexMap::new();
        row.insert("Department".to_string(), Cell::Text(department.to_string()));
        row.insert("Service Station Name".to_string(), Cell::Text(station.to_string()));
        row.insert("Quantity".to_string(), Cell::Text(quantity.to_string()));
        row
    }

    fn sheet(rows: Vec<RawRow>) -> Sheet {
        Sheet {
            name: "Sheet1".to_string(),
            headers: vec![
                "Department".to_string(),
                "Service Station Name".to_string(),
                "Quantity".to_string(),
            ],
            rows,
            blank_rows: 0,
        }
    }

    // -------------------------------------------------------------------------
    // END TO END
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_case_variants_share_one_department() {
        let sheet = sheet(vec![
            row("Ops", "Kisumu", "10"),
            row("ops", "Kisumu", "12,500.5"),
            row("OPS ", "kisumu", "abc"),
        ]);
        let prepared = prepare(&sheet, &AliasTable::default(), &config()).unwrap();
        assert_eq!(prepared.stats.rejected.get("quantity"), Some(&1));
        assert_eq!(prepared.columns.get("service_station").map(String::as_str), Some("Service Station Name"));
        assert!(prepared.unmapped.contains(&"date"));

        let mut store = MemoryStore::new();
        let outcome = load_records(&mut store, prepared.records, &options()).await.unwrap();

        let departments = store.rows(EntityKind::Department);
        assert_eq!(departments.len(), 1);
        assert_eq!(departments[0].name, "Ops");
        assert_eq!(store.rows(EntityKind::ServiceStation).len(), 1);

        assert_eq!(outcome.load.inserted, 3);
        assert_eq!(outcome.departments.created, 1);
        assert!(store
            .facts
            .iter()
            .all(|f| f.department_id == Some(departments[0].id)));
        assert_eq!(store.facts[1].quantity.map(|q| q.to_string()).as_deref(), Some("12500.50"));
        assert_eq!(store.facts[2].quantity, None);
    }

    #[tokio::test]
    async fn test_rerun_adds_facts_but_no_entities() {
        let sheet = sheet(vec![row("Finance", "Nairobi HQ", "5"), row("Ops", "nairobi-hq", "6")]);
        let mut store = MemoryStore::new();

        for _ in 0..2 {
            let prepared = prepare(&sheet, &AliasTable::default(), &config()).unwrap();
            load_records(&mut store, prepared.records, &options()).await.unwrap();
        }

        assert_eq!(store.rows(EntityKind::Department).len(), 2);
        assert_eq!(store.rows(EntityKind::ServiceStation).len(), 1);
        assert_eq!(store.facts.len(), 4);
    }

    #[tokio::test]
    async fn test_csv_input_end_to_end() {
        let csv = "Date,Department,Service Station Name,Region,Quantity (Litres),Customer Amount\n\
                   01/15/2024,Ops,Kisumu Depot,Western,40,\"6,400.00\"\n\
                   ,,,,,\n\
                   01/16/2024,Finance,Kisumu Depot,,35.5,5680\n";
        let sheet = read_csv(csv.as_bytes()).unwrap();
        assert_eq!(sheet.blank_rows, 1);

        let prepared = prepare(&sheet, &AliasTable::default(), &config()).unwrap();
        let mut store = MemoryStore::new();
        let outcome = load_records(&mut store, prepared.records, &options()).await.unwrap();

        assert_eq!(outcome.load.inserted, 2);
        assert_eq!(outcome.load.failed, 0);
        let stations = store.rows(EntityKind::ServiceStation);
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].region.as_deref(), Some("Western"));
        assert_eq!(
            store.facts[0].date,
            chrono::NaiveDate::from_ymd_opt(2024, 1, 15)
        );
    }

    #[test]
    fn test_missing_required_column_fails_before_loading() {
        let sheet = Sheet {
            name: "Sheet1".to_string(),
            headers: vec!["Department".to_string(), "Quantity".to_string()],
            rows: Vec::new(),
            blank_rows: 0,
        };
        let err = prepare(&sheet, &AliasTable::default(), &config()).unwrap_err();
        assert_eq!(err.missing, vec!["service_station"]);
    }

    #[test]
    fn test_dry_run_counts_distinct_names() {
        let sheet = sheet(vec![row("Ops", "A", "1"), row("ops", "B", "1"), row("HR", "a", "1")]);
        let prepared = prepare(&sheet, &AliasTable::default(), &config()).unwrap();
        let outcome = dry_run_outcome(&prepared.records);
        assert_eq!(outcome.departments.requested, 2);
        assert_eq!(outcome.service_stations.requested, 2);
        assert_eq!(outcome.load, LoadReport::default());
    }
}
