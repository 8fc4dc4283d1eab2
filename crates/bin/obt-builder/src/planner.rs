//! Partition planning: which partitions a run covers and what to do with each one.
//!
//! The decision itself ([`decide`]) is a pure function of three facts: whether the OBT already
//! holds rows for the key, whether the load ledger records a completed load of zero rows, and the
//! overwrite flag. [`plan`] gathers those facts from the database.

use std::ops::RangeInclusive;

use sqlx::{Executor, Postgres};

use crate::{
    ledger::{self, LedgerStatus},
    partition::{Month, Partition, ServiceType},
    schema::Tables,
    sql,
};

/// The ordered set of partitions a run walks: service, then year, then month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpace {
    services: Vec<ServiceType>,
    years: RangeInclusive<i32>,
    months: Vec<Month>,
}

impl PartitionSpace {
    /// Every service × every year of `[start, end]` × every month.
    pub fn full(start: i32, end: i32) -> Self {
        Self {
            services: ServiceType::ALL.to_vec(),
            years: start..=end,
            months: Month::all().collect(),
        }
    }

    /// A restricted space. Empty `services` or `months` mean "all".
    ///
    /// Selections are de-duplicated and put in processing order.
    pub fn selected(services: &[ServiceType], start: i32, end: i32, months: &[Month]) -> Self {
        let mut services = if services.is_empty() {
            ServiceType::ALL.to_vec()
        } else {
            services.to_vec()
        };
        services.sort();
        services.dedup();

        let mut months = if months.is_empty() {
            Month::all().collect()
        } else {
            months.to_vec()
        };
        months.sort();
        months.dedup();

        Self {
            services,
            years: start..=end,
            months,
        }
    }

    pub fn years(&self) -> &RangeInclusive<i32> {
        &self.years
    }

    pub fn iter(&self) -> impl Iterator<Item = Partition> + '_ {
        self.services.iter().flat_map(move |&service| {
            self.years.clone().flat_map(move |year| {
                self.months
                    .iter()
                    .map(move |&month| Partition::new(service, year, month))
            })
        })
    }
}

/// Why a partition is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The OBT already holds rows for the key.
    AlreadyLoaded,
    /// The OBT holds no rows, and the ledger records a completed load of zero rows.
    LoadedEmpty,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyLoaded => "already_loaded",
            Self::LoadedEmpty => "loaded_empty",
        }
    }
}

/// What to do with one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Leave the partition as it is.
    Skip(SkipReason),
    /// Delete the partition's rows, then load it.
    PurgeAndLoad,
    /// Load the partition into an empty key.
    Load,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip(_) => "skip",
            Self::PurgeAndLoad => "purge_and_load",
            Self::Load => "load",
        }
    }
}

/// Decides the fate of one partition.
///
/// - overwrite and rows present: purge, then load
/// - overwrite and no rows: load
/// - no overwrite and rows present: skip
/// - no overwrite, no rows, ledger says completed with zero rows: skip
/// - otherwise: load
pub fn decide(exists: bool, loaded_empty: bool, overwrite: bool) -> Decision {
    match (overwrite, exists, loaded_empty) {
        (true, true, _) => Decision::PurgeAndLoad,
        (true, false, _) => Decision::Load,
        (false, true, _) => Decision::Skip(SkipReason::AlreadyLoaded),
        (false, false, true) => Decision::Skip(SkipReason::LoadedEmpty),
        (false, false, false) => Decision::Load,
    }
}

/// The planner's verdict for one partition, with the facts it was based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub decision: Decision,
    pub existing_rows: i64,
}

/// Errors that occur while inspecting a partition.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Failed to count the partition's rows in the OBT
    #[error("Failed to count OBT rows for partition {partition}")]
    CountRows {
        partition: Partition,
        #[source]
        source: sqlx::Error,
    },
}

/// Errors that occur while purging a partition.
#[derive(Debug, thiserror::Error)]
pub enum PurgeError {
    /// Failed to execute the DELETE statement
    #[error("Failed to DELETE OBT rows for partition {partition}")]
    ExecuteDelete {
        partition: Partition,
        #[source]
        source: sqlx::Error,
    },
}

/// Counts the OBT rows carrying the partition key.
pub async fn count_rows<'c, E>(
    exe: E,
    tables: &Tables,
    partition: Partition,
) -> Result<i64, PlanError>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = sql::count_partition(&tables.obt);
    sqlx::query_scalar(&query)
        .bind(partition.service.as_str())
        .bind(partition.year)
        .bind(i32::from(partition.month))
        .fetch_one(exe)
        .await
        .map_err(|source| PlanError::CountRows { partition, source })
}

/// Inspects one partition and decides what to do with it.
///
/// The ledger is only consulted when the OBT holds no rows and overwrite is off. Only a completed
/// load that recorded zero rows counts: a key that was loaded with rows and is now empty (the OBT
/// is unlogged and truncated on crash recovery) is loaded again. A ledger read failure is logged
/// and treated as "no completed load".
pub async fn plan(
    conn: &mut sqlx::PgConnection,
    tables: &Tables,
    partition: Partition,
    overwrite: bool,
) -> Result<Plan, PlanError> {
    let existing_rows = count_rows(&mut *conn, tables, partition).await?;
    let exists = existing_rows > 0;

    let loaded_empty = if !exists && !overwrite {
        match ledger::get(&mut *conn, tables, partition).await {
            Ok(entry) => entry.is_some_and(|e| {
                e.status == LedgerStatus::Completed && e.row_count == Some(0)
            }),
            Err(err) => {
                tracing::warn!(
                    %partition,
                    error = %err,
                    error_source = %monitoring::logging::error_source(&err),
                    "ledger_read_failed"
                );
                false
            }
        }
    } else {
        false
    };

    Ok(Plan {
        decision: decide(exists, loaded_empty, overwrite),
        existing_rows,
    })
}

/// Deletes every OBT row of the partition and returns how many were removed.
pub async fn purge<'c, E>(exe: E, tables: &Tables, partition: Partition) -> Result<u64, PurgeError>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = sql::delete_partition(&tables.obt);
    let result = sqlx::query(&query)
        .bind(partition.service.as_str())
        .bind(partition.year)
        .bind(i32::from(partition.month))
        .execute(exe)
        .await
        .map_err(|source| PurgeError::ExecuteDelete { partition, source })?;

    Ok(result.rows_affected())
}
