//! Streams one partition from the raw tables into the OBT.
//!
//! The load is two `COPY` statements on the same session: the transform query is exported with
//! `COPY (...) TO STDOUT` into an in-memory buffer, and the buffer is imported with
//! `COPY ... FROM STDIN` using the OBT column list. Both sides use the same pipe-delimited CSV
//! options. One month of one service fits in memory comfortably; the buffer is released as soon
//! as the import finishes.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures::TryStreamExt as _;
use sqlx::PgConnection;

use crate::{
    partition::Partition,
    planner::{self, PlanError},
    query,
    schema::Tables,
};

/// Outcome of a successful partition load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadReport {
    /// OBT rows carrying the partition key after the load, counted by the database.
    pub rows: i64,
    /// Size of the exported CSV buffer.
    pub bytes: usize,
    pub elapsed: Duration,
}

impl LoadReport {
    /// Load throughput; zero when the load took no measurable time.
    pub fn rows_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.rows as f64 / secs
        } else {
            0.0
        }
    }
}

/// Errors that occur while loading a partition.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Failed to export the transformed partition
    #[error("Failed to COPY partition {partition} out of the raw tables")]
    CopyOut {
        partition: Partition,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to import the buffer into the OBT
    #[error("Failed to COPY partition {partition} into the OBT ({bytes} bytes buffered)")]
    CopyIn {
        partition: Partition,
        bytes: usize,
        #[source]
        source: sqlx::Error,
    },

    /// Failed to count the loaded rows
    #[error("Failed to count loaded rows")]
    Count(#[source] PlanError),
}

/// Loads one partition into the OBT.
///
/// Expects the partition key to be empty in the OBT (never loaded, or just purged). The returned
/// row count comes from a `COUNT(*)` over the key after the import, not from the `COPY` tag.
///
/// Runs on a plain connection or inside a transaction (`&mut *tx`).
pub async fn load(
    conn: &mut PgConnection,
    tables: &Tables,
    partition: Partition,
) -> Result<LoadReport, LoadError> {
    let start = Instant::now();

    tracing::info!(
        service = %partition.service,
        year = partition.year,
        month = partition.month.get(),
        "partition_export_started"
    );
    let export = query::copy_out_statement(tables, partition);
    let mut buffer = BytesMut::new();
    {
        let mut stream = conn
            .copy_out_raw(&export)
            .await
            .map_err(|source| LoadError::CopyOut { partition, source })?;
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|source| LoadError::CopyOut { partition, source })?
        {
            buffer.extend_from_slice(&chunk);
        }
    }
    let bytes = buffer.len();
    tracing::info!(
        service = %partition.service,
        year = partition.year,
        month = partition.month.get(),
        bytes,
        "partition_exported"
    );

    if bytes > 0 {
        let import = query::copy_in_statement(tables);
        let copy_in_err = |source| LoadError::CopyIn {
            partition,
            bytes,
            source,
        };

        let mut copy_in = conn.copy_in_raw(&import).await.map_err(copy_in_err)?;
        copy_in.send(buffer.freeze()).await.map_err(copy_in_err)?;
        let copied = copy_in.finish().await.map_err(copy_in_err)?;
        tracing::info!(
            service = %partition.service,
            year = partition.year,
            month = partition.month.get(),
            copied,
            "partition_imported"
        );
    }

    let rows = planner::count_rows(&mut *conn, tables, partition)
        .await
        .map_err(LoadError::Count)?;

    let report = LoadReport {
        rows,
        bytes,
        elapsed: start.elapsed(),
    };

    tracing::info!(
        service = %partition.service,
        year = partition.year,
        month = partition.month.get(),
        rows,
        bytes,
        elapsed_secs = report.elapsed.as_secs_f64(),
        rows_per_sec = report.rows_per_sec().round(),
        "partition_loaded"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_per_sec_divides_by_elapsed_seconds() {
        let report = LoadReport {
            rows: 1000,
            bytes: 4096,
            elapsed: Duration::from_millis(500),
        };
        assert_eq!(report.rows_per_sec(), 2000.0);
    }

    #[test]
    fn rows_per_sec_is_zero_without_elapsed_time() {
        let report = LoadReport {
            rows: 10,
            bytes: 128,
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.rows_per_sec(), 0.0);
    }
}
