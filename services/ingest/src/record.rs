//! Canonical record shapes: the cleaned transaction and the insert-ready fact row.

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use std::fmt;

/// Target type of a canonical field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Decimal,
    Date,
    Time,
}

/// Canonical fields of a fuel transaction, in insert column order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Date,
    Time,
    VehicleRegistration,
    Department,
    TruckModel,
    ServiceProvider,
    ServiceStation,
    Product,
    Quantity,
    FullTankCapacity,
    TerminalPrice,
    CustomerAmount,
    Region,
}

impl Field {
    pub const ALL: [Field; 13] = [
        Field::Date,
        Field::Time,
        Field::VehicleRegistration,
        Field::Department,
        Field::TruckModel,
        Field::ServiceProvider,
        Field::ServiceStation,
        Field::Product,
        Field::Quantity,
        Field::FullTankCapacity,
        Field::TerminalPrice,
        Field::CustomerAmount,
        Field::Region,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Date => "date",
            Field::Time => "time",
            Field::VehicleRegistration => "vehicle_registration",
            Field::Department => "department",
            Field::TruckModel => "truck_model",
            Field::ServiceProvider => "service_provider",
            Field::ServiceStation => "service_station",
            Field::Product => "product",
            Field::Quantity => "quantity",
            Field::FullTankCapacity => "full_tank_capacity",
            Field::TerminalPrice => "terminal_price",
            Field::CustomerAmount => "customer_amount",
            Field::Region => "region",
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            Field::Date => FieldKind::Date,
            Field::Time => FieldKind::Time,
            Field::Quantity
            | Field::FullTankCapacity
            | Field::TerminalPrice
            | Field::CustomerAmount => FieldKind::Decimal,
            _ => FieldKind::Text,
        }
    }

    pub fn from_name(name: &str) -> Option<Field> {
        let name = name.trim();
        Field::ALL.into_iter().find(|f| f.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A converted cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Decimal(Decimal),
    Date(NaiveDate),
    Time(NaiveTime),
}

/// A cleaned transaction. Any field without a valid value is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FuelRecord {
    /// 1-based line in the source sheet (header is line 1)
    pub source_row: usize,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub vehicle_registration: Option<String>,
    pub department: Option<String>,
    pub truck_model: Option<String>,
    pub service_provider: Option<String>,
    pub service_station: Option<String>,
    pub product: Option<String>,
    pub quantity: Option<Decimal>,
    pub full_tank_capacity: Option<Decimal>,
    pub terminal_price: Option<Decimal>,
    pub customer_amount: Option<Decimal>,
    pub region: Option<String>,
}

impl FuelRecord {
    pub fn new(source_row: usize) -> Self {
        Self {
            source_row,
            ..Self::default()
        }
    }

    /// Store a converted value. A value whose type does not match the
    /// field is dropped.
    pub fn set(&mut self, field: Field, value: Value) {
        match (field, value) {
            (Field::Date, Value::Date(d)) => self.date = Some(d),
            (Field::Time, Value::Time(t)) => self.time = Some(t),
            (Field::VehicleRegistration, Value::Text(s)) => self.vehicle_registration = Some(s),
            (Field::Department, Value::Text(s)) => self.department = Some(s),
            (Field::TruckModel, Value::Text(s)) => self.truck_model = Some(s),
            (Field::ServiceProvider, Value::Text(s)) => self.service_provider = Some(s),
            (Field::ServiceStation, Value::Text(s)) => self.service_station = Some(s),
            (Field::Product, Value::Text(s)) => self.product = Some(s),
            (Field::Quantity, Value::Decimal(d)) => self.quantity = Some(d),
            (Field::FullTankCapacity, Value::Decimal(d)) => self.full_tank_capacity = Some(d),
            (Field::TerminalPrice, Value::Decimal(d)) => self.terminal_price = Some(d),
            (Field::CustomerAmount, Value::Decimal(d)) => self.customer_amount = Some(d),
            (Field::Region, Value::Text(s)) => self.region = Some(s),
            _ => {}
        }
    }
}

/// A record with entity names replaced by foreign keys, ready for insertion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactRow {
    pub source_row: usize,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub vehicle_registration: Option<String>,
    pub department_id: Option<i32>,
    pub truck_model: Option<String>,
    pub service_provider: Option<String>,
    pub service_station_id: Option<i32>,
    pub product: Option<String>,
    pub quantity: Option<Decimal>,
    pub full_tank_capacity: Option<Decimal>,
    pub terminal_price: Option<Decimal>,
    pub customer_amount: Option<Decimal>,
    pub region: Option<String>,
}

impl FactRow {
    /// Persisted columns, each bound as one statement parameter
    pub const COLUMNS: usize = 13;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names_round_trip() {
        for field in Field::ALL {
            assert_eq!(Field::from_name(field.name()), Some(field));
        }
        assert_eq!(Field::from_name(" Department "), Some(Field::Department));
        assert_eq!(Field::from_name("odometer"), None);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(Field::Quantity.kind(), FieldKind::Decimal);
        assert_eq!(Field::CustomerAmount.kind(), FieldKind::Decimal);
        assert_eq!(Field::Date.kind(), FieldKind::Date);
        assert_eq!(Field::Time.kind(), FieldKind::Time);
        assert_eq!(Field::ServiceStation.kind(), FieldKind::Text);
    }

    #[test]
    fn test_set_ignores_mismatched_value() {
        let mut record = FuelRecord::new(2);
        record.set(Field::Quantity, Value::Text("12".to_string()));
        assert_eq!(record.quantity, None);

        record.set(Field::Quantity, Value::Decimal(Decimal::new(1250, 2)));
        assert_eq!(record.quantity, Some(Decimal::new(1250, 2)));
    }
}
