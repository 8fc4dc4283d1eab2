//! Post-load maintenance: statistics refresh and secondary indexes.
//!
//! Both run outside any transaction block: `VACUUM` and `CREATE INDEX CONCURRENTLY` are rejected
//! by PostgreSQL inside one. Failures here never fail the run; the rows are already loaded.

use sqlx::PgConnection;

use crate::{schema::Tables, sql};

/// A secondary index on the OBT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDef {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

/// Indexes built after a run that inserted rows.
pub const INDEXES: &[IndexDef] = &[
    IndexDef {
        name: "idx_obt_service_year_month",
        columns: &["service_type", "source_year", "source_month"],
    },
    IndexDef {
        name: "idx_obt_pickup_datetime",
        columns: &["pickup_datetime"],
    },
    IndexDef {
        name: "idx_obt_pu_borough",
        columns: &["pu_borough"],
    },
];

/// What the maintenance pass achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub analyzed: bool,
    /// Valid indexes that exist after the pass (created now or already present).
    pub built: Vec<&'static str>,
    /// Indexes whose creation failed.
    pub failed: Vec<&'static str>,
}

/// Refreshes planner statistics on the OBT, then creates its secondary [`INDEXES`].
pub async fn optimize(conn: &mut PgConnection, tables: &Tables) -> OptimizeReport {
    optimize_with(conn, tables, INDEXES).await
}

/// Refreshes planner statistics on the OBT, then creates `indexes` in order.
///
/// Each step is attempted independently; failures are logged and reported, never returned. An
/// index left invalid by an earlier failed concurrent build is dropped and built again.
pub async fn optimize_with(
    conn: &mut PgConnection,
    tables: &Tables,
    indexes: &[IndexDef],
) -> OptimizeReport {
    let mut report = OptimizeReport::default();

    tracing::info!(table = %tables.obt, "vacuum_analyze_started");
    match sqlx::raw_sql(&sql::vacuum_analyze(&tables.obt))
        .execute(&mut *conn)
        .await
    {
        Ok(_) => {
            report.analyzed = true;
            tracing::info!(table = %tables.obt, "vacuum_analyze_completed");
        }
        Err(err) => {
            tracing::warn!(
                table = %tables.obt,
                error = %err,
                error_source = %monitoring::logging::error_source(&err),
                "vacuum_analyze_failed"
            );
        }
    }

    for index in indexes {
        match build_index(conn, tables, index).await {
            Ok(()) => {
                tracing::info!(index = index.name, "index_ready");
                report.built.push(index.name);
            }
            Err(err) => {
                tracing::warn!(
                    index = index.name,
                    error = %err,
                    error_source = %monitoring::logging::error_source(&err),
                    "index_creation_failed"
                );
                report.failed.push(index.name);
            }
        }
    }

    report
}

async fn build_index(
    conn: &mut PgConnection,
    tables: &Tables,
    index: &IndexDef,
) -> Result<(), sqlx::Error> {
    let qualified = sql::qualified(&tables.analytics_schema, index.name);

    let invalid: Option<bool> = sqlx::query_scalar(sql::INDEX_IS_INVALID)
        .bind(&qualified)
        .fetch_optional(&mut *conn)
        .await?;
    if invalid == Some(true) {
        tracing::warn!(index = index.name, "invalid_index_dropped");
        sqlx::raw_sql(&sql::drop_index_concurrently(&qualified))
            .execute(&mut *conn)
            .await?;
    }

    let statement = sql::create_index_concurrently(index.name, &tables.obt, index.columns);
    sqlx::raw_sql(&statement).execute(&mut *conn).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_names_are_valid_identifiers() {
        for index in INDEXES {
            sql::validate_identifier(index.name).expect("index name should be valid");
            assert!(!index.columns.is_empty());
        }
    }

    #[test]
    fn indexed_columns_exist_in_the_obt() {
        let columns = crate::schema::obt_column_names();
        for index in INDEXES {
            for column in index.columns {
                assert!(columns.contains(column), "{column} is not an OBT column");
            }
        }
    }
}
