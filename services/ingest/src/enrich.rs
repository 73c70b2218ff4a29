//! Swap entity names for foreign keys.

use serde::Serialize;
use tracing::warn;

use crate::record::{FactRow, FuelRecord};
use crate::resolver::{NameRequest, Resolution};

/// Rows whose entity name was present but did not resolve to an id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnresolvedCounts {
    pub departments: usize,
    pub service_stations: usize,
}

#[derive(Debug, Default)]
pub struct Enrichment {
    pub rows: Vec<FactRow>,
    pub unresolved: UnresolvedCounts,
}

/// Department names in first-seen order
pub fn department_requests(records: &[FuelRecord]) -> Vec<NameRequest> {
    records
        .iter()
        .filter_map(|r| r.department.as_deref())
        .map(NameRequest::new)
        .collect()
}

/// Station names with the region seen on the same row
pub fn station_requests(records: &[FuelRecord]) -> Vec<NameRequest> {
    records
        .iter()
        .filter_map(|r| {
            r.service_station
                .as_deref()
                .map(|name| NameRequest::with_region(name, r.region.clone()))
        })
        .collect()
}

fn lookup(name: Option<&str>, ids: &Resolution, misses: &mut usize) -> Option<i32> {
    let name = name?;
    let id = ids.id_for(name);
    if id.is_none() {
        *misses += 1;
    }
    id
}

fn to_fact(
    record: FuelRecord,
    departments: &Resolution,
    stations: &Resolution,
    unresolved: &mut UnresolvedCounts,
) -> FactRow {
    let department_id = lookup(record.department.as_deref(), departments, &mut unresolved.departments);
    let service_station_id = lookup(
        record.service_station.as_deref(),
        stations,
        &mut unresolved.service_stations,
    );
    FactRow {
        source_row: record.source_row,
        date: record.date,
        time: record.time,
        vehicle_registration: record.vehicle_registration,
        department_id,
        truck_model: record.truck_model,
        service_provider: record.service_provider,
        service_station_id,
        product: record.product,
        quantity: record.quantity,
        full_tank_capacity: record.full_tank_capacity,
        terminal_price: record.terminal_price,
        customer_amount: record.customer_amount,
        region: record.region,
    }
}

/// Replace entity names with ids. A name missing from its resolution
/// becomes a null foreign key; the rest of the row is kept as is.
pub fn enrich(
    records: Vec<FuelRecord>,
    departments: &Resolution,
    stations: &Resolution,
) -> Enrichment {
    let mut unresolved = UnresolvedCounts::default();
    let rows: Vec<FactRow> = records
        .into_iter()
        .map(|record| to_fact(record, departments, stations, &mut unresolved))
        .collect();

    if unresolved.departments > 0 {
        warn!(rows = unresolved.departments, "rows with unresolved department, stored with null department_id");
    }
    if unresolved.service_stations > 0 {
        warn!(
            rows = unresolved.service_stations,
            "rows with unresolved service station, stored with null service_station_id"
        );
    }

    Enrichment { rows, unresolved }
}
