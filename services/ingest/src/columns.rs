//! Maps spreadsheet headers onto canonical fields.
//!
//! Headers are compared after normalization: trimmed, lower-cased, with
//! parentheses dropped and runs of whitespace or hyphens turned into `_`.
//! So `"Vehicle Registration Number"`, `" vehicle registration number "`
//! and `"Quantity (Litres)"` match the aliases `vehicle_registration_number`
//! and `quantity_litres`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::{ConfigError, MappingError};
use crate::record::Field;
use crate::source::{Cell, RawRow};

/// Known header aliases per canonical field, already in normalized form
const DEFAULT_ALIASES: &[(Field, &[&str])] = &[
    (Field::Date, &["date", "transaction_date"]),
    (Field::Time, &["time", "transaction_time"]),
    (
        Field::VehicleRegistration,
        &[
            "vehicle_registration_number",
            "vehicle_registration",
            "registration_number",
            "vehicle_reg",
        ],
    ),
    (Field::Department, &["department", "department_name"]),
    (Field::TruckModel, &["truck_model", "vehicle_model"]),
    (Field::ServiceProvider, &["service_provider", "provider"]),
    (
        Field::ServiceStation,
        &["service_station_name", "service_station", "station_name"],
    ),
    (Field::Product, &["product/service", "product", "product_service"]),
    (
        Field::Quantity,
        &["quantity", "quantity_litres", "quantity_liters", "litres"],
    ),
    (Field::FullTankCapacity, &["full_tank_capacity", "tank_capacity"]),
    (Field::TerminalPrice, &["terminal_price", "price_per_litre"]),
    (Field::CustomerAmount, &["customer_amount", "amount"]),
    (Field::Region, &["region", "station_region"]),
];

/// Normalize a header for alias comparison
pub fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| *c != '(' && *c != ')')
        .collect::<String>()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Header alias table, built-in entries first
#[derive(Debug, Clone)]
pub struct AliasTable {
    aliases: Vec<(Field, Vec<String>)>,
}

impl Default for AliasTable {
    fn default() -> Self {
        Self {
            aliases: DEFAULT_ALIASES
                .iter()
                .map(|(field, names)| (*field, names.iter().map(|n| n.to_string()).collect()))
                .collect(),
        }
    }
}

impl AliasTable {
    /// Add aliases from a `{ "<field>": ["alias", ...] }` map
    pub fn extend(&mut self, extra: HashMap<String, Vec<String>>) -> Result<(), ConfigError> {
        for (field_name, names) in extra {
            let field =
                Field::from_name(&field_name).ok_or(ConfigError::UnknownField(field_name))?;
            if let Some((_, list)) = self.aliases.iter_mut().find(|(f, _)| *f == field) {
                list.extend(names.iter().map(|n| normalize_header(n)));
            }
        }
        Ok(())
    }

    /// Load extra aliases from a JSON file
    pub fn load_extra(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read column aliases {}", path.display()))?;
        let extra: HashMap<String, Vec<String>> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse column aliases {}", path.display()))?;
        self.extend(extra)?;
        Ok(())
    }

    fn aliases_for(&self, field: Field) -> &[String] {
        self.aliases
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, names)| names.as_slice())
            .unwrap_or_default()
    }
}

/// Resolved header -> field assignment for one sheet
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    columns: BTreeMap<Field, String>,
    missing: Vec<Field>,
}

impl ColumnMapping {
    /// Match each canonical field to the first header that carries one of
    /// its aliases. Fields with no match are recorded as missing.
    pub fn from_headers(headers: &[String], table: &AliasTable) -> Self {
        let normalized: Vec<(String, &String)> = headers
            .iter()
            .filter(|h| !h.trim().is_empty())
            .map(|h| (normalize_header(h), h))
            .collect();

        let mut columns = BTreeMap::new();
        let mut missing = Vec::new();

        for field in Field::ALL {
            let aliases = table.aliases_for(field);
            // Alias order is priority order
            let found = aliases.iter().find_map(|alias| {
                normalized
                    .iter()
                    .find(|(norm, original)| {
                        norm == alias && !columns.values().any(|taken| taken == *original)
                    })
                    .map(|(_, original)| (*original).clone())
            });
            match found {
                Some(header) => {
                    debug!(field = %field, header = %header, "column mapped");
                    columns.insert(field, header);
                }
                None => missing.push(field),
            }
        }

        Self { columns, missing }
    }

    pub fn header_for(&self, field: Field) -> Option<&str> {
        self.columns.get(&field).map(String::as_str)
    }

    pub fn missing(&self) -> &[Field] {
        &self.missing
    }

    /// Log every missing field as a warning
    pub fn report_missing(&self) {
        for field in &self.missing {
            warn!(field = %field, "no source column for canonical field, values will be null");
        }
    }

    /// Fail when any of `required` has no source column at all
    pub fn check_required(&self, required: &[Field], headers: &[String]) -> Result<(), MappingError> {
        let missing: Vec<&'static str> = required
            .iter()
            .filter(|f| self.missing.contains(f))
            .map(|f| f.name())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MappingError {
                missing,
                found: headers.to_vec(),
            })
        }
    }

    /// Project a raw row onto canonical fields. Unmapped fields and cells
    /// absent from the row are left out.
    pub fn apply<'a>(&self, row: &'a RawRow) -> Vec<(Field, &'a Cell)> {
        self.columns
            .iter()
            .filter_map(|(field, header)| row.get(header).map(|cell| (*field, cell)))
            .collect()
    }
}
