//! Run configuration, parsed once at start-up from flags and environment variables.
//!
//! Every component receives the [`Config`] (or values derived from it) explicitly; nothing else
//! in the crate reads the process environment.

use clap::Parser;
use sqlx::postgres::PgConnectOptions;

use crate::{
    partition::{Month, ServiceType},
    planner::PartitionSpace,
    sql::{self, ValidateIdentifierError},
};

mod redacted;

pub use self::redacted::Redacted;

/// Maximum length of the run identifier, bounded by the `run_id VARCHAR(50)` column.
pub const MAX_RUN_ID_LEN: usize = 50;

#[derive(Parser, Debug, Clone)]
#[command(name = "obt-builder")]
#[command(version)]
#[command(args_override_self = true)]
#[command(about = "Builds the NYC taxi One Big Table in PostgreSQL", long_about = None)]
pub struct Config {
    /// Destination PostgreSQL host
    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub pg_host: String,

    /// Destination PostgreSQL port
    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub pg_port: u16,

    /// Destination database name
    #[arg(long, env = "POSTGRES_DB")]
    pub pg_database: String,

    /// Database user
    #[arg(long, env = "POSTGRES_USER")]
    pub pg_user: String,

    /// Database password
    #[arg(long, env = "POSTGRES_PASSWORD", hide_env_values = true, value_parser = parse_secret)]
    pub pg_password: Redacted<String>,

    /// Schema holding the raw trip tables and the zone lookup
    #[arg(long, env = "PG_SCHEMA_RAW", default_value = "raw")]
    pub raw_schema: String,

    /// Schema the OBT and its load ledger are written to
    #[arg(long, env = "PG_SCHEMA_ANALYTICS", default_value = "analytics")]
    pub analytics_schema: String,

    /// Run identifier, recorded in the load ledger for every partition this run touches
    #[arg(long, env = "RUN_ID")]
    pub run_id: String,

    /// Build mode
    ///
    /// `full` processes every service and month of the year range. `by-partition` restricts the
    /// run to the services and months given with `--service` and `--month`.
    #[arg(long, env = "OBT_MODE", value_enum, default_value = "full")]
    pub mode: Mode,

    /// First source year to build (inclusive)
    #[arg(long, env = "OBT_YEAR_START", default_value_t = 2020)]
    pub year_start: i32,

    /// Last source year to build (inclusive)
    #[arg(long, env = "OBT_YEAR_END", default_value_t = 2022)]
    pub year_end: i32,

    /// Purge and reload partitions that are already present
    #[arg(long, env = "OBT_OVERWRITE")]
    pub overwrite: bool,

    /// Service to build, repeatable (by-partition mode only, default: all)
    #[arg(long = "service", value_enum)]
    pub services: Vec<ServiceType>,

    /// Month to build, 1-12, repeatable (by-partition mode only, default: all)
    #[arg(long = "month")]
    pub months: Vec<Month>,

    /// Run each partition's purge and load in one transaction
    ///
    /// A failed reload then restores the purged rows instead of leaving the partition empty.
    #[arg(long, env = "OBT_ATOMIC_PARTITIONS")]
    pub atomic_partitions: bool,

    /// Session `work_mem` and `maintenance_work_mem`, e.g. `512MB`
    #[arg(long, env = "OBT_WORK_MEM", default_value = "512MB")]
    pub work_mem: MemoryBudget,
}

/// Build mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Every service × year × month of the range.
    Full,
    /// Only the selected services and months of the range.
    ByPartition,
}

/// Errors that occur when validating a parsed [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The year range is empty
    #[error("year range is empty: start {start} is after end {end}")]
    InvalidYearRange { start: i32, end: i32 },

    /// A schema name is not a safe identifier
    #[error("Invalid schema name '{name}'")]
    InvalidSchema {
        name: String,
        #[source]
        source: ValidateIdentifierError,
    },

    /// The run identifier is blank
    #[error("run id cannot be empty")]
    EmptyRunId,

    /// The run identifier does not fit the `run_id` column
    #[error("run id exceeds {MAX_RUN_ID_LEN} bytes (got {length})")]
    RunIdTooLong { length: usize },

    /// `--service` or `--month` was given in full mode
    #[error("--service and --month require --mode by-partition")]
    SelectionRequiresByPartition,
}

impl Config {
    /// Checks the rules clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.year_start > self.year_end {
            return Err(ConfigError::InvalidYearRange {
                start: self.year_start,
                end: self.year_end,
            });
        }

        for name in [&self.raw_schema, &self.analytics_schema] {
            sql::validate_identifier(name).map_err(|source| ConfigError::InvalidSchema {
                name: name.clone(),
                source,
            })?;
        }

        if self.run_id.trim().is_empty() {
            return Err(ConfigError::EmptyRunId);
        }
        if self.run_id.len() > MAX_RUN_ID_LEN {
            return Err(ConfigError::RunIdTooLong {
                length: self.run_id.len(),
            });
        }

        if self.mode == Mode::Full && (!self.services.is_empty() || !self.months.is_empty()) {
            return Err(ConfigError::SelectionRequiresByPartition);
        }

        Ok(())
    }

    /// The partitions this run covers, in processing order.
    pub fn partition_space(&self) -> PartitionSpace {
        match self.mode {
            Mode::Full => PartitionSpace::full(self.year_start, self.year_end),
            Mode::ByPartition => PartitionSpace::selected(
                &self.services,
                self.year_start,
                self.year_end,
                &self.months,
            ),
        }
    }

    /// Connection options for the destination database.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.pg_host)
            .port(self.pg_port)
            .database(&self.pg_database)
            .username(&self.pg_user)
            .password(&self.pg_password)
            .application_name("obt-builder")
    }
}

fn parse_secret(value: &str) -> Result<Redacted<String>, std::convert::Infallible> {
    Ok(Redacted::from(value.to_string()))
}

/// A PostgreSQL memory setting such as `512MB`.
///
/// Restricted to `<digits><kB|MB|GB>` because the value is interpolated into a `SET` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBudget(String);

impl MemoryBudget {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemoryBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for MemoryBudget {
    type Err = InvalidMemoryBudgetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit_start = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| InvalidMemoryBudgetError(s.to_string()))?;
        let (amount, unit) = s.split_at(unit_start);

        if amount.is_empty() || !matches!(unit, "kB" | "MB" | "GB") {
            return Err(InvalidMemoryBudgetError(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }
}

/// Returned for memory settings not of the form `<digits><kB|MB|GB>`.
#[derive(Debug, thiserror::Error)]
#[error("invalid memory setting '{0}', expected e.g. '512MB' (units: kB, MB, GB)")]
pub struct InvalidMemoryBudgetError(String);
