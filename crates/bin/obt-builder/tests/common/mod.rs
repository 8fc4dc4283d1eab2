//! Shared fixtures: an ephemeral PostgreSQL with the raw schema seeded.
#![allow(dead_code)]

use clap::Parser as _;
use obt_builder::{Config, ServiceType, query::ServiceColumns};
use pgtemp::PgTempDB;
use sqlx::{Connection as _, PgConnection, types::chrono::NaiveDateTime};

pub const RAW_RUN_ID: &str = "raw-ingest-01";

/// Start a temp database and open a verification connection to it.
///
/// The returned `PgTempDB` must be kept alive for the duration of the test.
pub async fn setup() -> (PgTempDB, PgConnection) {
    // Set C locale for pgtemp
    unsafe {
        std::env::set_var("LANG", "C");
    }
    monitoring::logging::init();

    let temp_db = PgTempDB::new();
    let mut conn = PgConnection::connect(&temp_db.connection_uri())
        .await
        .expect("Failed to connect to test database");

    seed_raw_schema(&mut conn).await;

    (temp_db, conn)
}

/// Build a run configuration against the temp database.
pub fn config(temp_db: &PgTempDB, run_id: &str, extra: &[&str]) -> Config {
    let port = temp_db.db_port().to_string();
    let user = temp_db.db_user().to_string();
    let password = temp_db.db_pass().to_string();
    let database = temp_db.db_name().to_string();

    let mut args = vec![
        "obt-builder",
        "--pg-host",
        "localhost",
        "--pg-port",
        port.as_str(),
        "--pg-database",
        database.as_str(),
        "--pg-user",
        user.as_str(),
        "--pg-password",
        password.as_str(),
        "--run-id",
        run_id,
        "--work-mem",
        "64MB",
    ];
    args.extend_from_slice(extra);

    Config::try_parse_from(args).expect("valid test arguments")
}

/// Configuration restricted to one year and a set of months, both services.
pub fn partition_config(
    temp_db: &PgTempDB,
    run_id: &str,
    year: i32,
    months: &[u8],
    extra: &[&str],
) -> Config {
    let year = year.to_string();
    let months: Vec<String> = months.iter().map(|m| m.to_string()).collect();

    let mut args = vec![
        "--mode",
        "by-partition",
        "--year-start",
        year.as_str(),
        "--year-end",
        year.as_str(),
    ];
    for month in &months {
        args.push("--month");
        args.push(month.as_str());
    }
    args.extend_from_slice(extra);

    config(temp_db, run_id, &args)
}

async fn seed_raw_schema(conn: &mut PgConnection) {
    sqlx::raw_sql(indoc::indoc! {r#"
        CREATE SCHEMA raw;

        CREATE TABLE raw.yellow_taxi_trip (
            "VendorID" BIGINT,
            tpep_pickup_datetime TIMESTAMP,
            tpep_dropoff_datetime TIMESTAMP,
            passenger_count BIGINT,
            trip_distance DOUBLE PRECISION,
            "RatecodeID" BIGINT,
            store_and_fwd_flag TEXT,
            "PULocationID" INTEGER,
            "DOLocationID" INTEGER,
            payment_type BIGINT,
            fare_amount DOUBLE PRECISION,
            extra DOUBLE PRECISION,
            mta_tax DOUBLE PRECISION,
            tip_amount DOUBLE PRECISION,
            tolls_amount DOUBLE PRECISION,
            improvement_surcharge DOUBLE PRECISION,
            total_amount DOUBLE PRECISION,
            -- INTEGER like the OBT; a fractional raw value fails the whole partition import
            congestion_surcharge INTEGER,
            airport_fee INTEGER,
            run_id TEXT,
            source_year INTEGER,
            source_month INTEGER,
            ingested_at_utc TIMESTAMP
        );

        CREATE TABLE raw.green_taxi_trip (
            "VendorID" BIGINT,
            lpep_pickup_datetime TIMESTAMP,
            lpep_dropoff_datetime TIMESTAMP,
            store_and_fwd_flag TEXT,
            "RatecodeID" BIGINT,
            "PULocationID" INTEGER,
            "DOLocationID" INTEGER,
            passenger_count BIGINT,
            trip_distance DOUBLE PRECISION,
            fare_amount DOUBLE PRECISION,
            extra DOUBLE PRECISION,
            mta_tax DOUBLE PRECISION,
            tip_amount DOUBLE PRECISION,
            tolls_amount DOUBLE PRECISION,
            ehail_fee DOUBLE PRECISION,
            improvement_surcharge DOUBLE PRECISION,
            total_amount DOUBLE PRECISION,
            payment_type BIGINT,
            trip_type DOUBLE PRECISION,
            congestion_surcharge INTEGER,
            airport_fee INTEGER,
            run_id TEXT,
            source_year INTEGER,
            source_month INTEGER,
            ingested_at_utc TIMESTAMP
        );

        CREATE TABLE raw.taxi_zone_lookup (
            "LocationID" INTEGER,
            "Borough" TEXT,
            "Zone" TEXT,
            service_zone TEXT
        );

        INSERT INTO raw.taxi_zone_lookup VALUES
            (1, 'EWR', 'Newark Airport', 'EWR'),
            (2, 'Queens', 'Jamaica Bay', 'Boro Zone'),
            (3, 'Bronx', 'Allerton/Pelham Gardens', 'Boro Zone'),
            (4, 'Manhattan', 'Alphabet City', 'Yellow Zone'),
            (5, 'Staten Island', 'Arden Heights', 'Boro Zone');
    "#})
    .execute(conn)
    .await
    .expect("Failed to seed raw schema");
}

/// Insert `count` synthetic trips into a raw partition, one minute apart, each 12 minutes long.
pub async fn insert_generated(
    conn: &mut PgConnection,
    service: ServiceType,
    year: i32,
    month: u8,
    count: i64,
) {
    let ServiceColumns {
        pickup, dropoff, ..
    } = ServiceColumns::for_service(service);
    let (trip_type_column, trip_type_value) = match service {
        ServiceType::Yellow => ("", ""),
        ServiceType::Green => (", trip_type", ", 1.0"),
    };

    let query = indoc::formatdoc! {r#"
        INSERT INTO raw.{service}_taxi_trip (
            "VendorID", {pickup}, {dropoff}, passenger_count, trip_distance, "RatecodeID",
            store_and_fwd_flag, "PULocationID", "DOLocationID", payment_type, fare_amount, extra,
            mta_tax, tip_amount, tolls_amount, improvement_surcharge, total_amount,
            congestion_surcharge, airport_fee, run_id, source_year, source_month, ingested_at_utc
            {trip_type_column}
        )
        SELECT
            2,
            make_timestamp($2, $3, 1, 0, 0, 0) + make_interval(mins => i::int),
            make_timestamp($2, $3, 1, 0, 12, 0) + make_interval(mins => i::int),
            1, 2.4, 1, 'N', (i % 6) + 1, (i % 5) + 1, 1, 10.0, 0.5, 0.5, 2.0, 0.0, 0.3, 13.3,
            2, 0, '{RAW_RUN_ID}', $2, $3, timezone('UTC', now())
            {trip_type_value}
        FROM generate_series(1, $1::BIGINT) AS i
    "#};

    sqlx::query(&query)
        .bind(count)
        .bind(year)
        .bind(i32::from(month))
        .execute(conn)
        .await
        .expect("Failed to insert generated trips");
}

/// One hand-written raw trip. `tag` lands in `passenger_count` to find the row in the OBT.
#[derive(Debug, Clone, Copy)]
pub struct RawTrip {
    pub tag: i64,
    pub pickup: NaiveDateTime,
    pub dropoff: NaiveDateTime,
    pub pu_location: i32,
    pub do_location: i32,
    pub distance: f64,
    pub fare: f64,
    pub tip: f64,
}

pub async fn insert_trip(
    conn: &mut PgConnection,
    service: ServiceType,
    year: i32,
    month: u8,
    trip: RawTrip,
) {
    let ServiceColumns {
        pickup, dropoff, ..
    } = ServiceColumns::for_service(service);

    let query = indoc::formatdoc! {r#"
        INSERT INTO raw.{service}_taxi_trip (
            "VendorID", {pickup}, {dropoff}, passenger_count, trip_distance, "PULocationID",
            "DOLocationID", fare_amount, tip_amount, total_amount, run_id, source_year,
            source_month, ingested_at_utc
        )
        VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $7 + $8, '{RAW_RUN_ID}', $9, $10, timezone('UTC', now()))
    "#};

    sqlx::query(&query)
        .bind(trip.pickup)
        .bind(trip.dropoff)
        .bind(trip.tag)
        .bind(trip.distance)
        .bind(trip.pu_location)
        .bind(trip.do_location)
        .bind(trip.fare)
        .bind(trip.tip)
        .bind(year)
        .bind(i32::from(month))
        .execute(conn)
        .await
        .expect("Failed to insert trip");
}

/// Rows of the OBT under one partition key.
pub async fn obt_count(conn: &mut PgConnection, service: ServiceType, year: i32, month: u8) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM analytics.obt_trips \
         WHERE service_type = $1 AND source_year = $2 AND source_month = $3",
    )
    .bind(service.as_str())
    .bind(year)
    .bind(i32::from(month))
    .fetch_one(conn)
    .await
    .expect("Failed to count OBT rows")
}

/// Ledger status and row count of one partition.
pub async fn ledger_entry(
    conn: &mut PgConnection,
    service: ServiceType,
    year: i32,
    month: u8,
) -> Option<(String, Option<i64>, Option<String>)> {
    sqlx::query_as(
        "SELECT status, row_count, error FROM analytics.obt_load_ledger \
         WHERE service_type = $1 AND source_year = $2 AND source_month = $3",
    )
    .bind(service.as_str())
    .bind(year)
    .bind(i32::from(month))
    .fetch_optional(conn)
    .await
    .expect("Failed to read ledger")
}

pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    sqlx::types::chrono::NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .expect("valid timestamp")
}
