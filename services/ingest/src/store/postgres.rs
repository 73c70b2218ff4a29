//! Postgres implementation over one exclusively owned connection.

use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::query_builder::Separated;
use sqlx::{Connection, Postgres, QueryBuilder};
use tracing::{debug, info, warn};

use crate::error::{ConnectError, StoreError};
use crate::normalize::normalize;
use crate::record::FactRow;
use crate::retry::RetryPolicy;

use super::{classify, is_transient, EntityKind, FactSink, ReferenceStore, StoredEntity};

/// SQL twin of `normalize::normalize` for a `name` column: punctuation to
/// spaces, whitespace runs collapsed, trimmed, upper-cased.
const NORMALIZED_NAME_SQL: &str = "upper(btrim(regexp_replace(regexp_replace(name, '[^[:alnum:][:space:]]', ' ', 'g'), '[[:space:]]+', ' ', 'g')))";

const INSERT_FACTS_SQL: &str = "INSERT INTO fuel_transactions \
    (date, time, vehicle_registration, department_id, truck_model, service_provider, \
     service_station_id, product, quantity, full_tank_capacity, terminal_price, customer_amount, region) ";

const REQUIRED_TABLES: [&str; 3] = ["departments", "service_stations", "fuel_transactions"];

/// Names whose normalized form depends on the database character class and
/// case mapping rules
const NORMALIZATION_SAMPLES: [&str; 3] = ["Énergie Ltd.", "nairobi-hq", "Ñuñoa  Sur"];

/// Opens connections with bounded exponential backoff
#[derive(Debug, Clone)]
pub struct Connector {
    options: PgConnectOptions,
    retry: RetryPolicy,
}

impl Connector {
    pub fn new(options: PgConnectOptions, retry: RetryPolicy) -> Self {
        Self { options, retry }
    }

    /// Connect, retrying transient failures. Authentication and
    /// configuration errors fail on the first attempt.
    pub async fn connect(&self) -> Result<PgConnection, ConnectError> {
        let conn = self
            .retry
            .run(
                "connect",
                || PgConnection::connect_with(&self.options),
                is_transient,
            )
            .await
            .map_err(ConnectError::Unreachable)?;
        info!(
            host = self.options.get_host(),
            database = self.options.get_database().unwrap_or_default(),
            "connected to database"
        );
        Ok(conn)
    }

    /// Close `old` (best effort) and connect again
    pub async fn reconnect(&self, old: PgConnection) -> Result<PgConnection, ConnectError> {
        if let Err(e) = old.close().await {
            debug!(error = %e, "closing stale connection failed");
        }
        self.connect().await
    }
}

pub struct PgStore {
    connector: Connector,
    // None only between a failed reconnect and the end of the run
    conn: Option<PgConnection>,
}

impl PgStore {
    pub async fn open(connector: Connector) -> Result<Self, ConnectError> {
        let conn = connector.connect().await?;
        Ok(Self {
            connector,
            conn: Some(conn),
        })
    }

    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.conn.as_mut().ok_or_else(|| {
            StoreError::Connection(sqlx::Error::Protocol("connection is closed".to_string()))
        })
    }

    /// Fail unless every table the load writes to exists
    pub async fn verify_schema(&mut self) -> Result<(), StoreError> {
        for table in REQUIRED_TABLES {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1)",
            )
            .bind(table)
            .fetch_one(self.conn()?)
            .await
            .map_err(classify)?;
            if !exists {
                return Err(ConnectError::MissingTable(table).into());
            }
        }
        self.check_normalization().await
    }

    /// Warn when the database normalizes names differently from the loader.
    /// A `C`/`POSIX` LC_CTYPE leaves non-ASCII letters out of `[:alnum:]` and
    /// `upper()`, so the unique indexes would disagree with the resolver.
    async fn check_normalization(&mut self) -> Result<(), StoreError> {
        let sql = format!("SELECT {NORMALIZED_NAME_SQL} FROM (SELECT $1::text AS name) AS t");
        let mut results = Vec::with_capacity(NORMALIZATION_SAMPLES.len());
        for sample in NORMALIZATION_SAMPLES {
            let normalized: Option<String> = sqlx::query_scalar(&sql)
                .bind(sample)
                .fetch_one(self.conn()?)
                .await
                .map_err(classify)?;
            results.push((sample, normalized));
        }
        let mismatched = normalization_mismatches(&results);
        if !mismatched.is_empty() {
            warn!(
                samples = ?mismatched,
                "database name normalization differs from the loader; use a UTF-8 LC_CTYPE"
            );
        }
        Ok(())
    }

    pub async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "closing connection failed");
            }
        }
    }

    async fn reopen(&mut self) -> Result<(), StoreError> {
        let fresh = match self.conn.take() {
            Some(old) => self.connector.reconnect(old).await?,
            None => self.connector.connect().await?,
        };
        self.conn = Some(fresh);
        warn!("database connection re-established");
        Ok(())
    }
}

/// Samples whose database result differs from `normalize`
fn normalization_mismatches<'a>(results: &[(&'a str, Option<String>)]) -> Vec<&'a str> {
    results
        .iter()
        .filter(|(sample, db)| normalize(sample).as_deref() != db.as_deref().filter(|s| !s.is_empty()))
        .map(|(sample, _)| *sample)
        .collect()
}

async fn insert_fact(conn: &mut PgConnection, row: &FactRow) -> Result<(), sqlx::Error> {
    let mut qb = QueryBuilder::<Postgres>::new(INSERT_FACTS_SQL);
    qb.push_values(std::iter::once(row), push_fact);
    qb.build().execute(conn).await?;
    Ok(())
}

fn push_fact<'a>(mut b: Separated<'_, 'a, Postgres, &'static str>, row: &'a FactRow) {
    b.push_bind(row.date)
        .push_bind(row.time)
        .push_bind(row.vehicle_registration.as_deref())
        .push_bind(row.department_id)
        .push_bind(row.truck_model.as_deref())
        .push_bind(row.service_provider.as_deref())
        .push_bind(row.service_station_id)
        .push_bind(row.product.as_deref())
        .push_bind(row.quantity)
        .push_bind(row.full_tank_capacity)
        .push_bind(row.terminal_price)
        .push_bind(row.customer_amount)
        .push_bind(row.region.as_deref());
}

impl ReferenceStore for PgStore {
    async fn find_entities(
        &mut self,
        kind: EntityKind,
        names: &[String],
        normalized: &[String],
    ) -> Result<Vec<StoredEntity>, StoreError> {
        let sql = format!(
            "SELECT id, name FROM {} WHERE name = ANY($1) OR {} = ANY($2) ORDER BY id",
            kind.table(),
            NORMALIZED_NAME_SQL
        );
        sqlx::query_as::<_, StoredEntity>(&sql)
            .bind(names)
            .bind(normalized)
            .fetch_all(self.conn()?)
            .await
            .map_err(classify)
    }

    async fn insert_entity(
        &mut self,
        kind: EntityKind,
        name: &str,
        region: Option<&str>,
    ) -> Result<i32, StoreError> {
        let conn = self.conn()?;
        let result = if kind.has_region() {
            let sql = format!(
                "INSERT INTO {} (name, region) VALUES ($1, $2) RETURNING id",
                kind.table()
            );
            sqlx::query_scalar::<_, i32>(&sql)
                .bind(name)
                .bind(region)
                .fetch_one(conn)
                .await
        } else {
            let sql = format!("INSERT INTO {} (name) VALUES ($1) RETURNING id", kind.table());
            sqlx::query_scalar::<_, i32>(&sql)
                .bind(name)
                .fetch_one(conn)
                .await
        };
        result.map_err(classify)
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        self.reopen().await
    }
}

impl FactSink for PgStore {
    async fn insert_chunk(&mut self, rows: &[FactRow]) -> Result<u64, StoreError> {
        let mut tx = self.conn()?.begin().await.map_err(classify)?;

        let mut qb = QueryBuilder::<Postgres>::new(INSERT_FACTS_SQL);
        qb.push_values(rows, push_fact);
        let result = qb.build().execute(&mut *tx).await.map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn insert_each(
        &mut self,
        rows: &[FactRow],
    ) -> Result<Vec<Result<(), StoreError>>, StoreError> {
        let mut tx = self.conn()?.begin().await.map_err(classify)?;
        let mut outcomes = Vec::with_capacity(rows.len());

        for row in rows {
            // Nested begin is a savepoint: a failed row rolls back alone
            let mut savepoint = Connection::begin(&mut *tx).await.map_err(classify)?;
            match insert_fact(&mut savepoint, row).await.map_err(classify) {
                Ok(()) => {
                    savepoint.commit().await.map_err(classify)?;
                    outcomes.push(Ok(()));
                }
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => {
                    savepoint.rollback().await.map_err(classify)?;
                    outcomes.push(Err(e));
                }
            }
        }

        tx.commit().await.map_err(classify)?;
        Ok(outcomes)
    }

    async fn reconnect(&mut self) -> Result<(), StoreError> {
        self.reopen().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lists_every_fact_column() {
        let columns = INSERT_FACTS_SQL
            .split_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(list, _)| list.split(',').count());
        assert_eq!(columns, Some(FactRow::COLUMNS));
    }

    #[test]
    fn test_normalization_mismatches() {
        let utf8 = vec![
            ("Énergie Ltd.", Some("ÉNERGIE LTD".to_string())),
            ("nairobi-hq", Some("NAIROBI HQ".to_string())),
            ("Ñuñoa  Sur", Some("ÑUÑOA SUR".to_string())),
        ];
        assert!(normalization_mismatches(&utf8).is_empty());

        // What a C locale produces: non-ASCII letters count as punctuation
        let c_locale = vec![
            ("Énergie Ltd.", Some("NERGIE LTD".to_string())),
            ("nairobi-hq", Some("NAIROBI HQ".to_string())),
            ("Ñuñoa  Sur", Some("U OA SUR".to_string())),
        ];
        assert_eq!(normalization_mismatches(&c_locale), vec!["Énergie Ltd.", "Ñuñoa  Sur"]);

        assert!(normalization_mismatches(&[("--", Some(String::new()))]).is_empty());
        assert_eq!(normalization_mismatches(&[("Ops", None)]), vec!["Ops"]);
    }

    #[test]
    fn test_schema_indexes_use_the_lookup_expression() {
        let schema = include_str!("../../../../db/schema.sql");
        assert_eq!(schema.matches(NORMALIZED_NAME_SQL).count(), 2);
        assert!(schema.contains("LC_CTYPE"));
        for table in REQUIRED_TABLES {
            assert!(schema.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")));
        }
    }
}
