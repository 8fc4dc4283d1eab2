//! Destination table layout and idempotent creation.
//!
//! The OBT schema is fixed and versionless: there are no migrations, and a layout change needs a
//! manual `DROP` of the table. The table is `UNLOGGED`, so it is fast to load and lost on a crash
//! of the database server; treat it as rebuildable output, not as a system of record.

use sqlx::PgConnection;

use crate::{
    partition::ServiceType,
    sql::{self, ValidateIdentifierError},
};

/// Name of the OBT inside the analytics schema.
pub const OBT_TABLE: &str = "obt_trips";

/// Name of the load ledger inside the analytics schema.
pub const LEDGER_TABLE: &str = "obt_load_ledger";

/// Name of the zone dimension inside the raw schema.
pub const ZONE_LOOKUP_TABLE: &str = "taxi_zone_lookup";

/// OBT columns in load order, with their PostgreSQL types.
///
/// The surrogate `trip_id` is omitted: it is filled by its sequence. This list drives the DDL,
/// the `COPY ... FROM STDIN` column list, and must match the projection order of
/// [`transform_query`](crate::query::transform_query).
pub const OBT_COLUMNS: &[(&str, &str)] = &[
    ("service_type", "VARCHAR(10)"),
    ("pickup_datetime", "TIMESTAMP"),
    ("dropoff_datetime", "TIMESTAMP"),
    ("pickup_hour", "INTEGER"),
    ("pickup_dow", "INTEGER"),
    ("month", "INTEGER"),
    ("year", "INTEGER"),
    ("pu_location_id", "INTEGER"),
    ("pu_zone", "VARCHAR(100)"),
    ("pu_borough", "VARCHAR(50)"),
    ("do_location_id", "INTEGER"),
    ("do_zone", "VARCHAR(100)"),
    ("do_borough", "VARCHAR(50)"),
    ("vendor_id", "BIGINT"),
    ("rate_code_id", "BIGINT"),
    ("payment_type", "BIGINT"),
    ("trip_type", "DOUBLE PRECISION"),
    ("store_and_fwd_flag", "VARCHAR(10)"),
    ("passenger_count", "BIGINT"),
    ("trip_distance", "DOUBLE PRECISION"),
    ("fare_amount", "DOUBLE PRECISION"),
    ("extra", "DOUBLE PRECISION"),
    ("mta_tax", "DOUBLE PRECISION"),
    ("tip_amount", "DOUBLE PRECISION"),
    ("tolls_amount", "DOUBLE PRECISION"),
    ("improvement_surcharge", "DOUBLE PRECISION"),
    ("congestion_surcharge", "INTEGER"),
    ("airport_fee", "INTEGER"),
    ("total_amount", "DOUBLE PRECISION"),
    ("trip_duration_min", "DOUBLE PRECISION"),
    ("avg_speed_mph", "DOUBLE PRECISION"),
    ("tip_pct", "DOUBLE PRECISION"),
    ("run_id", "VARCHAR(50)"),
    ("source_year", "INTEGER"),
    ("source_month", "INTEGER"),
    ("ingested_at_utc", "TIMESTAMP"),
];

/// Names of [`OBT_COLUMNS`], in order.
pub fn obt_column_names() -> Vec<&'static str> {
    OBT_COLUMNS.iter().map(|(name, _)| *name).collect()
}

/// Validated, quoted, schema-qualified names of every table the builder touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    /// Unquoted analytics schema name, for `CREATE SCHEMA`.
    pub analytics_schema: String,
    /// `analytics.obt_trips`
    pub obt: String,
    /// `analytics.obt_load_ledger`
    pub ledger: String,
    /// `raw.yellow_taxi_trip`
    pub yellow_trips: String,
    /// `raw.green_taxi_trip`
    pub green_trips: String,
    /// `raw.taxi_zone_lookup`
    pub zone_lookup: String,
}

impl Tables {
    /// Validates both schema names and builds the qualified table names.
    pub fn new(raw_schema: &str, analytics_schema: &str) -> Result<Self, ValidateIdentifierError> {
        sql::validate_identifier(raw_schema)?;
        sql::validate_identifier(analytics_schema)?;

        Ok(Self {
            analytics_schema: analytics_schema.to_string(),
            obt: sql::qualified(analytics_schema, OBT_TABLE),
            ledger: sql::qualified(analytics_schema, LEDGER_TABLE),
            yellow_trips: sql::qualified(raw_schema, raw_trip_table(ServiceType::Yellow)),
            green_trips: sql::qualified(raw_schema, raw_trip_table(ServiceType::Green)),
            zone_lookup: sql::qualified(raw_schema, ZONE_LOOKUP_TABLE),
        })
    }

    /// The raw table a service is read from.
    pub fn raw_trips(&self, service: ServiceType) -> &str {
        match service {
            ServiceType::Yellow => &self.yellow_trips,
            ServiceType::Green => &self.green_trips,
        }
    }
}

/// Unqualified name of a service's raw trip table.
pub fn raw_trip_table(service: ServiceType) -> &'static str {
    match service {
        ServiceType::Yellow => "yellow_taxi_trip",
        ServiceType::Green => "green_taxi_trip",
    }
}

/// Errors that occur when creating the destination tables.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Failed to create the analytics schema
    #[error("Failed to create schema '{schema}'")]
    CreateSchema {
        schema: String,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to execute CREATE TABLE DDL statement
    #[error("Failed to execute CREATE TABLE for '{table_name}' with {num_columns} columns")]
    ExecuteDdl {
        table_name: String,
        num_columns: usize,
        #[source]
        source: sqlx::Error,
    },
}

/// Format the OBT DDL.
pub fn obt_ddl(tables: &Tables) -> String {
    let mut columns = vec!["trip_id SERIAL PRIMARY KEY".to_string()];
    columns.extend(
        OBT_COLUMNS
            .iter()
            .map(|(name, pg_type)| format!("{} {}", sql::quote_column(name), pg_type)),
    );

    format!(
        "CREATE UNLOGGED TABLE IF NOT EXISTS {} ({})",
        tables.obt,
        columns.join(", ")
    )
}

/// Format the ledger DDL.
pub fn ledger_ddl(tables: &Tables) -> String {
    indoc::formatdoc! {r#"
        CREATE TABLE IF NOT EXISTS {ledger} (
            service_type VARCHAR(10) NOT NULL,
            source_year INTEGER NOT NULL,
            source_month INTEGER NOT NULL,
            status TEXT NOT NULL,
            row_count BIGINT,
            run_id VARCHAR(50),
            error TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT (timezone('UTC', now())),
            PRIMARY KEY (service_type, source_year, source_month)
        )
    "#, ledger = tables.ledger}
}

/// Creates the analytics schema and the OBT if they do not exist. Safe to call on every run.
#[tracing::instrument(skip_all, err)]
pub async fn ensure_table(conn: &mut PgConnection, tables: &Tables) -> Result<(), SchemaError> {
    tracing::info!(table = %tables.obt, "ensuring_obt_table");

    sqlx::raw_sql(&sql::create_schema(&tables.analytics_schema))
        .execute(&mut *conn)
        .await
        .map_err(|source| SchemaError::CreateSchema {
            schema: tables.analytics_schema.clone(),
            source,
        })?;

    sqlx::raw_sql(&obt_ddl(tables))
        .execute(&mut *conn)
        .await
        .map_err(|source| SchemaError::ExecuteDdl {
            table_name: tables.obt.clone(),
            num_columns: OBT_COLUMNS.len() + 1,
            source,
        })?;

    tracing::info!(table = %tables.obt, "obt_table_ready");
    Ok(())
}

/// Creates the load ledger if it does not exist. Expects the analytics schema to exist.
#[tracing::instrument(skip_all, err)]
pub async fn ensure_ledger(conn: &mut PgConnection, tables: &Tables) -> Result<(), SchemaError> {
    sqlx::raw_sql(&ledger_ddl(tables))
        .execute(&mut *conn)
        .await
        .map_err(|source| SchemaError::ExecuteDdl {
            table_name: tables.ledger.clone(),
            num_columns: 8,
            source,
        })?;

    tracing::debug!(table = %tables.ledger, "ledger_table_ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Tables {
        Tables::new("raw", "analytics").unwrap()
    }

    #[test]
    fn tables_are_schema_qualified() {
        let tables = tables();

        assert_eq!(tables.obt, "analytics.obt_trips");
        assert_eq!(tables.ledger, "analytics.obt_load_ledger");
        assert_eq!(tables.raw_trips(ServiceType::Yellow), "raw.yellow_taxi_trip");
        assert_eq!(tables.raw_trips(ServiceType::Green), "raw.green_taxi_trip");
        assert_eq!(tables.zone_lookup, "raw.taxi_zone_lookup");
    }

    #[test]
    fn tables_reject_unsafe_schema_names() {
        assert!(Tables::new("raw; DROP SCHEMA analytics", "analytics").is_err());
        assert!(Tables::new("raw", "analytics.obt").is_err());
        assert!(Tables::new("raw", "").is_err());
    }

    #[test]
    fn obt_ddl_is_unlogged_and_idempotent() {
        let ddl = obt_ddl(&tables());

        assert!(ddl.starts_with("CREATE UNLOGGED TABLE IF NOT EXISTS analytics.obt_trips ("));
        assert!(ddl.contains("trip_id SERIAL PRIMARY KEY"));
        assert!(ddl.contains("tip_pct DOUBLE PRECISION"));
        assert!(ddl.contains("ingested_at_utc TIMESTAMP"));
    }

    #[test]
    fn obt_columns_are_unique() {
        let mut names = obt_column_names();
        let total = names.len();
        names.sort();
        names.dedup();

        assert_eq!(names.len(), total);
        assert_eq!(total, 36);
    }
}
