//! Per-partition load ledger.
//!
//! The OBT alone cannot tell "loaded, and the source had zero rows" from "never attempted": both
//! leave zero rows under the key. The ledger keeps one row per partition key recording the last
//! attempt, so empty partitions that loaded successfully are not reprocessed on every run.
//!
//! A partition only reaches [`LedgerStatus::Completed`] after its rows are in the OBT and counted.
//! A purge marks it [`LedgerStatus::Purged`] first, so a crash between purge and reload leaves a
//! status the planner will not skip.

use sqlx::{Executor, Postgres, types::chrono::NaiveDateTime};

use crate::{partition::Partition, schema::Tables};

/// Status of the last load attempt for a partition.
///
/// Stored as `TEXT`. Unrecognised values decode as [`LedgerStatus::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerStatus {
    /// A load has started and not yet finished.
    Running,
    /// The load finished; `row_count` holds the authoritative count.
    Completed,
    /// The load failed; `error` holds the message.
    Failed,
    /// The partition's rows were deleted ahead of a reload.
    Purged,
    /// Not written by this version.
    Unknown,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Purged => "PURGED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::str::FromStr for LedgerStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if s.eq_ignore_ascii_case("RUNNING") => Ok(Self::Running),
            s if s.eq_ignore_ascii_case("COMPLETED") => Ok(Self::Completed),
            s if s.eq_ignore_ascii_case("FAILED") => Ok(Self::Failed),
            s if s.eq_ignore_ascii_case("PURGED") => Ok(Self::Purged),
            _ => Ok(Self::Unknown),
        }
    }
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<Postgres> for LedgerStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for LedgerStatus {
    fn decode(
        value: <Postgres as sqlx::Database>::ValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let value: &str = sqlx::Decode::<Postgres>::decode(value)?;
        let Ok(status) = value.parse::<LedgerStatus>();
        Ok(status)
    }
}

impl<'q> sqlx::Encode<'q, Postgres> for LedgerStatus {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        sqlx::Encode::<Postgres>::encode_by_ref(&self.as_str(), buf)
    }
}

/// One ledger row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerEntry {
    pub status: LedgerStatus,
    pub row_count: Option<i64>,
    pub run_id: Option<String>,
    pub error: Option<String>,
    pub updated_at: NaiveDateTime,
}

/// Errors that occur when reading or writing the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Failed to upsert the ledger row
    #[error("Failed to record ledger status {status} for partition {partition}")]
    Record {
        partition: Partition,
        status: LedgerStatus,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to read the ledger row
    #[error("Failed to read ledger entry for partition {partition}")]
    Read {
        partition: Partition,
        #[source]
        source: sqlx::Error,
    },
}

/// Records the latest status of a partition, replacing any previous entry.
pub async fn record<'c, E>(
    exe: E,
    tables: &Tables,
    partition: Partition,
    status: LedgerStatus,
    run_id: &str,
    row_count: Option<i64>,
    error: Option<&str>,
) -> Result<(), LedgerError>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::formatdoc! {r#"
        INSERT INTO {ledger} (service_type, source_year, source_month, status, row_count, run_id, error, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, timezone('UTC', now()))
        ON CONFLICT (service_type, source_year, source_month) DO UPDATE
        SET status = EXCLUDED.status,
            row_count = EXCLUDED.row_count,
            run_id = EXCLUDED.run_id,
            error = EXCLUDED.error,
            updated_at = EXCLUDED.updated_at
    "#, ledger = tables.ledger};

    sqlx::query(&query)
        .bind(partition.service.as_str())
        .bind(partition.year)
        .bind(i32::from(partition.month))
        .bind(status)
        .bind(row_count)
        .bind(run_id)
        .bind(error)
        .execute(exe)
        .await
        .map_err(|source| LedgerError::Record {
            partition,
            status,
            source,
        })?;

    Ok(())
}

/// Reads the ledger entry of a partition, if any.
pub async fn get<'c, E>(
    exe: E,
    tables: &Tables,
    partition: Partition,
) -> Result<Option<LedgerEntry>, LedgerError>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = indoc::formatdoc! {r#"
        SELECT status, row_count, run_id, error, updated_at
        FROM {ledger}
        WHERE service_type = $1 AND source_year = $2 AND source_month = $3
    "#, ledger = tables.ledger};

    sqlx::query_as(&query)
        .bind(partition.service.as_str())
        .bind(partition.year)
        .bind(i32::from(partition.month))
        .fetch_optional(exe)
        .await
        .map_err(|source| LedgerError::Read { partition, source })
}
