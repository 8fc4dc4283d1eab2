//! The extract/transform query for one partition.
//!
//! The query reads one raw partition, joins the zone dimension twice (pickup and dropoff, both
//! `LEFT JOIN` so unmatched location ids keep the trip with NULL zone and borough), and computes
//! the derived columns:
//!
//! - `pickup_hour`, `pickup_dow`, `month`, `year` from the pickup timestamp
//! - `trip_duration_min` = (dropoff - pickup) in minutes
//! - `avg_speed_mph` = distance / elapsed hours, NULL unless elapsed time is positive
//! - `tip_pct` = 100 * tip / fare, NULL unless the fare is positive
//!
//! The filter is on the raw `source_year`/`source_month`, never on the pickup timestamp: the
//! recorded partition key is authoritative even when the pickup falls in another month.
//!
//! `COPY (query) TO STDOUT` does not accept bind parameters, so the partition key is rendered
//! into the text. It only ever comes from typed values: the service literal from a closed enum,
//! the year as an `i32` and the month as a validated [`Month`](crate::partition::Month).

use crate::{
    partition::{Partition, ServiceType},
    schema::{self, Tables},
    sql,
};

/// Source columns that differ between the raw service tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceColumns {
    pub pickup: &'static str,
    pub dropoff: &'static str,
    /// Projection for `trip_type`; services without the column get a typed NULL.
    pub trip_type: &'static str,
}

impl ServiceColumns {
    pub fn for_service(service: ServiceType) -> Self {
        match service {
            ServiceType::Yellow => Self {
                pickup: "tpep_pickup_datetime",
                dropoff: "tpep_dropoff_datetime",
                trip_type: "NULL::DOUBLE PRECISION",
            },
            ServiceType::Green => Self {
                pickup: "lpep_pickup_datetime",
                dropoff: "lpep_dropoff_datetime",
                trip_type: "t.trip_type",
            },
        }
    }
}

/// Builds the read query for one partition.
///
/// The projection order matches [`OBT_COLUMNS`](crate::schema::OBT_COLUMNS).
pub fn transform_query(tables: &Tables, partition: Partition) -> String {
    let ServiceColumns {
        pickup,
        dropoff,
        trip_type,
    } = ServiceColumns::for_service(partition.service);
    let elapsed_secs = format!("EXTRACT(EPOCH FROM (t.{dropoff} - t.{pickup}))");

    indoc::formatdoc! {r#"
        SELECT
            '{service}' AS service_type,
            t.{pickup} AS pickup_datetime,
            t.{dropoff} AS dropoff_datetime,
            EXTRACT(HOUR FROM t.{pickup})::INT AS pickup_hour,
            EXTRACT(DOW FROM t.{pickup})::INT AS pickup_dow,
            EXTRACT(MONTH FROM t.{pickup})::INT AS month,
            EXTRACT(YEAR FROM t.{pickup})::INT AS year,
            t."PULocationID" AS pu_location_id,
            zpu."Zone" AS pu_zone,
            zpu."Borough" AS pu_borough,
            t."DOLocationID" AS do_location_id,
            zdo."Zone" AS do_zone,
            zdo."Borough" AS do_borough,
            t."VendorID" AS vendor_id,
            t."RatecodeID" AS rate_code_id,
            t.payment_type AS payment_type,
            {trip_type} AS trip_type,
            t.store_and_fwd_flag AS store_and_fwd_flag,
            t.passenger_count AS passenger_count,
            t.trip_distance AS trip_distance,
            t.fare_amount AS fare_amount,
            t.extra AS extra,
            t.mta_tax AS mta_tax,
            t.tip_amount AS tip_amount,
            t.tolls_amount AS tolls_amount,
            t.improvement_surcharge AS improvement_surcharge,
            t.congestion_surcharge AS congestion_surcharge,
            t.airport_fee AS airport_fee,
            t.total_amount AS total_amount,
            {elapsed_secs} / 60.0 AS trip_duration_min,
            CASE
                WHEN {elapsed_secs} > 0
                THEN t.trip_distance / ({elapsed_secs} / 3600.0)
                ELSE NULL
            END AS avg_speed_mph,
            CASE
                WHEN t.fare_amount > 0 THEN (t.tip_amount / t.fare_amount) * 100.0
                ELSE NULL
            END AS tip_pct,
            t.run_id AS run_id,
            t.source_year AS source_year,
            t.source_month AS source_month,
            t.ingested_at_utc AS ingested_at_utc
        FROM {raw_trips} t
        LEFT JOIN {zone_lookup} zpu ON t."PULocationID" = zpu."LocationID"
        LEFT JOIN {zone_lookup} zdo ON t."DOLocationID" = zdo."LocationID"
        WHERE t.source_year = {year}
          AND t.source_month = {month}"#,
        service = partition.service.as_str(),
        raw_trips = tables.raw_trips(partition.service),
        zone_lookup = tables.zone_lookup,
        year = partition.year,
        month = partition.month.get(),
    }
}

/// `COPY (<transform query>) TO STDOUT` for one partition.
pub fn copy_out_statement(tables: &Tables, partition: Partition) -> String {
    sql::copy_to_stdout(&transform_query(tables, partition))
}

/// `COPY <obt> (<columns>) FROM STDIN`, matching the export's column order and CSV options.
pub fn copy_in_statement(tables: &Tables) -> String {
    sql::copy_from_stdin(&tables.obt, &schema::obt_column_names())
}

#[cfg(test)]
mod tests {
    use sqlparser::{
        ast::{SelectItem, SetExpr, Statement},
        dialect::PostgreSqlDialect,
        parser::Parser,
    };

    use super::*;
    use crate::partition::Month;

    fn tables() -> Tables {
        Tables::new("raw", "analytics").unwrap()
    }

    fn partition(service: ServiceType, year: i32, month: u8) -> Partition {
        Partition::new(service, year, Month::new(month).unwrap())
    }

    /// Output column names of the query, as seen by a SQL parser.
    fn projection_aliases(sql: &str) -> Vec<String> {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).expect("query should parse");
        assert_eq!(statements.len(), 1);

        let Statement::Query(query) = &statements[0] else {
            panic!("expected a query");
        };
        let SetExpr::Select(select) = query.body.as_ref() else {
            panic!("expected a plain SELECT");
        };

        select
            .projection
            .iter()
            .map(|item| match item {
                SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
                other => panic!("every projection needs an alias, got {other}"),
            })
            .collect()
    }

    #[test]
    fn projection_matches_obt_column_order() {
        for service in ServiceType::ALL {
            let sql = transform_query(&tables(), partition(service, 2021, 3));
            assert_eq!(projection_aliases(&sql), schema::obt_column_names());
        }
    }

    #[test]
    fn yellow_reads_tpep_columns_and_nulls_trip_type() {
        let sql = transform_query(&tables(), partition(ServiceType::Yellow, 2021, 3));

        assert!(sql.contains("'yellow' AS service_type"));
        assert!(sql.contains("t.tpep_pickup_datetime AS pickup_datetime"));
        assert!(sql.contains("t.tpep_dropoff_datetime AS dropoff_datetime"));
        assert!(sql.contains("NULL::DOUBLE PRECISION AS trip_type"));
        assert!(sql.contains("FROM raw.yellow_taxi_trip t"));
        assert!(!sql.contains("lpep_"));
    }

    #[test]
    fn green_reads_lpep_columns_and_trip_type() {
        let sql = transform_query(&tables(), partition(ServiceType::Green, 2022, 11));

        assert!(sql.contains("'green' AS service_type"));
        assert!(sql.contains("t.lpep_pickup_datetime AS pickup_datetime"));
        assert!(sql.contains("t.trip_type AS trip_type"));
        assert!(sql.contains("FROM raw.green_taxi_trip t"));
        assert!(!sql.contains("tpep_"));
    }

    #[test]
    fn zone_joins_are_left_outer() {
        let sql = transform_query(&tables(), partition(ServiceType::Yellow, 2021, 3));

        assert!(sql.contains(
            "LEFT JOIN raw.taxi_zone_lookup zpu ON t.\"PULocationID\" = zpu.\"LocationID\""
        ));
        assert!(sql.contains(
            "LEFT JOIN raw.taxi_zone_lookup zdo ON t.\"DOLocationID\" = zdo.\"LocationID\""
        ));
        assert!(!sql.contains("INNER JOIN"));
    }

    #[test]
    fn filters_on_source_partition_key() {
        let sql = transform_query(&tables(), partition(ServiceType::Green, 2020, 7));

        assert!(sql.contains("WHERE t.source_year = 2020"));
        assert!(sql.contains("AND t.source_month = 7"));
    }

    #[test]
    fn derived_ratios_are_guarded() {
        let sql = transform_query(&tables(), partition(ServiceType::Yellow, 2021, 3));

        assert!(sql.contains(
            "WHEN EXTRACT(EPOCH FROM (t.tpep_dropoff_datetime - t.tpep_pickup_datetime)) > 0"
        ));
        assert!(sql.contains("WHEN t.fare_amount > 0 THEN (t.tip_amount / t.fare_amount) * 100.0"));
    }

    #[test]
    fn copy_statements_wrap_the_query_and_column_list() {
        let tables = tables();
        let export = copy_out_statement(&tables, partition(ServiceType::Yellow, 2021, 3));
        let import = copy_in_statement(&tables);

        assert!(export.starts_with("COPY (SELECT"));
        assert!(export.ends_with(") TO STDOUT WITH (FORMAT CSV, DELIMITER '|')"));
        assert!(import.starts_with("COPY analytics.obt_trips (service_type, pickup_datetime,"));
        assert!(import.contains("ingested_at_utc) FROM STDIN"));
    }
}
