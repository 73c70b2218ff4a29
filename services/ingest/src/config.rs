//! Runtime configuration from environment variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;

use crate::convert::ConversionRules;
use crate::error::ConfigError;
use crate::loader::{LoadOptions, MAX_CHUNK_SIZE};
use crate::record::Field;
use crate::retry::RetryPolicy;

const DEFAULT_REQUIRED: &str = "department,service_station";

/// Database endpoint, either a full URL or discrete parts
#[derive(Clone)]
pub enum DbConfig {
    Url(String),
    Parts {
        host: String,
        port: u16,
        user: String,
        password: Option<String>,
        database: String,
    },
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbConfig::Url(_) => f.write_str("DbConfig::Url(<redacted>)"),
            DbConfig::Parts {
                host,
                port,
                user,
                database,
                ..
            } => f
                .debug_struct("DbConfig::Parts")
                .field("host", host)
                .field("port", port)
                .field("user", user)
                .field("database", database)
                .finish_non_exhaustive(),
        }
    }
}

impl DbConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        match self {
            DbConfig::Url(url) => {
                PgConnectOptions::from_str(url).map_err(|e| ConfigError::Invalid {
                    key: "DB_URL",
                    value: "<redacted>".to_string(),
                    reason: e.to_string(),
                })
            }
            DbConfig::Parts {
                host,
                port,
                user,
                password,
                database,
            } => {
                let mut options = PgConnectOptions::new()
                    .host(host)
                    .port(*port)
                    .username(user)
                    .database(database);
                if let Some(password) = password {
                    options = options.password(password);
                }
                Ok(options)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `None` when no database variables are set; only a dry run can proceed
    pub db: Option<DbConfig>,
    pub retry: RetryPolicy,
    pub load: LoadOptions,
    pub rules: ConversionRules,
    pub required: Vec<Field>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key -> value source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db = match get("DB_URL") {
            Some(url) => Some(DbConfig::Url(url)),
            None => match get("DB_HOST") {
                Some(host) => Some(DbConfig::Parts {
                    host,
                    port: parse(&get, "DB_PORT", 5432)?,
                    user: get("DB_USER").ok_or(ConfigError::Missing("DB_USER"))?,
                    password: get("DB_PASS"),
                    database: get("DB_NAME").ok_or(ConfigError::Missing("DB_NAME"))?,
                }),
                None => None,
            },
        };

        let defaults = ConversionRules::default();
        let config = Self {
            db,
            retry: RetryPolicy {
                max_attempts: parse(&get, "INGEST_MAX_ATTEMPTS", 5)?,
                base_delay: Duration::from_secs(parse(&get, "INGEST_BACKOFF_MIN_SECS", 5)?),
                max_delay: Duration::from_secs(parse(&get, "INGEST_BACKOFF_MAX_SECS", 60)?),
            },
            load: LoadOptions {
                chunk_size: parse(&get, "INGEST_CHUNK_SIZE", 300)?,
                pause: Duration::from_millis(parse(&get, "INGEST_CHUNK_PAUSE_MS", 100)?),
            },
            rules: ConversionRules {
                max_string_len: parse(&get, "INGEST_MAX_STRING_LEN", defaults.max_string_len)?,
                decimal_scale: parse(&get, "INGEST_DECIMAL_SCALE", defaults.decimal_scale)?,
                date_format: get("INGEST_DATE_FORMAT").unwrap_or(defaults.date_format),
                time_format: get("INGEST_TIME_FORMAT").unwrap_or(defaults.time_format),
            },
            required: parse_fields(
                &lookup("INGEST_REQUIRED_FIELDS").unwrap_or_else(|| DEFAULT_REQUIRED.to_string()),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges. Call again after applying command-line overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.load.chunk_size == 0 {
            return Err(invalid("INGEST_CHUNK_SIZE", "0", "must be at least 1"));
        }
        if self.load.chunk_size > MAX_CHUNK_SIZE {
            return Err(invalid(
                "INGEST_CHUNK_SIZE",
                &self.load.chunk_size.to_string(),
                &format!("must be at most {MAX_CHUNK_SIZE} (database bind parameter limit)"),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("INGEST_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(invalid(
                "INGEST_BACKOFF_MIN_SECS",
                &self.retry.base_delay.as_secs().to_string(),
                "must not exceed INGEST_BACKOFF_MAX_SECS",
            ));
        }
        if self.rules.decimal_scale > 10 {
            return Err(invalid(
                "INGEST_DECIMAL_SCALE",
                &self.rules.decimal_scale.to_string(),
                "must be at most 10",
            ));
        }
        if self.rules.max_string_len == 0 {
            return Err(invalid("INGEST_MAX_STRING_LEN", "0", "must be at least 1"));
        }
        Ok(())
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        self.db
            .as_ref()
            .ok_or(ConfigError::Missing("DB_URL or DB_HOST"))?
            .connect_options()
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

/// Parse a comma separated list of canonical field names. An empty list
/// means no field is required.
pub fn parse_fields(list: &str) -> Result<Vec<Field>, ConfigError> {
    let mut fields = Vec::new();
    for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let field = Field::from_name(name).ok_or_else(|| ConfigError::UnknownField(name.to_string()))?;
        if !fields.contains(&field) {
            fields.push(field);
        }
    }
    Ok(fields)
}
