//! Drives a build: schema, then every partition of the space in order, then maintenance.
//!
//! Failure policy:
//! - schema creation, partition inspection and purges are fatal and end the run
//! - a failed load is logged, recorded in the ledger and counted; the run moves on
//! - maintenance failures are logged only
//!
//! Ledger writes never fail the run.

use std::time::{Duration, Instant};

use sqlx::{Connection as _, PgConnection};

use crate::{
    config::Config,
    ledger::{self, LedgerStatus},
    loader::{self, LoadError},
    optimizer::{self, OptimizeReport},
    partition::Partition,
    planner::{self, Decision, PartitionSpace, PlanError, PurgeError},
    schema::{self, SchemaError, Tables},
    sql::ValidateIdentifierError,
};

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A configured schema name is not a safe identifier
    #[error("Invalid schema name in configuration")]
    InvalidIdentifier(#[source] ValidateIdentifierError),

    /// Failed to create the destination tables
    #[error("Failed to prepare destination tables")]
    Schema(#[source] SchemaError),

    /// Failed to inspect a partition
    #[error("Failed to plan partition")]
    Plan(#[source] PlanError),

    /// Failed to purge a partition ahead of its reload
    #[error("Failed to purge partition")]
    Purge(#[source] PurgeError),

    /// Failed to open the transaction of an atomic partition
    #[error("Failed to begin transaction for partition {partition}")]
    BeginTransaction {
        partition: Partition,
        #[source]
        source: sqlx::Error,
    },
}

/// Totals of a completed run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Partitions loaded successfully, including loads of zero rows.
    pub loaded: usize,
    pub skipped: usize,
    /// Partitions whose existing rows were deleted (and stayed deleted).
    pub purged: usize,
    pub failed: usize,
    pub failed_partitions: Vec<Partition>,
    pub rows_inserted: i64,
    pub rows_purged: u64,
    /// `None` when no rows were inserted and maintenance was skipped.
    pub optimize: Option<OptimizeReport>,
    pub elapsed: Duration,
}

/// Result of one partition that was not skipped.
enum Outcome {
    Loaded { rows: i64, purged_rows: Option<u64> },
    Failed { purged_rows: Option<u64> },
}

/// Runs builds over one database session.
pub struct Orchestrator<'a> {
    conn: &'a mut PgConnection,
    tables: Tables,
    run_id: &'a str,
    overwrite: bool,
    atomic_partitions: bool,
}

impl<'a> Orchestrator<'a> {
    /// Prepares a build for `config`, validating its schema names.
    pub fn new(config: &'a Config, conn: &'a mut PgConnection) -> Result<Self, OrchestratorError> {
        let tables = Tables::new(&config.raw_schema, &config.analytics_schema)
            .map_err(OrchestratorError::InvalidIdentifier)?;

        Ok(Self {
            conn,
            tables,
            run_id: &config.run_id,
            overwrite: config.overwrite,
            atomic_partitions: config.atomic_partitions,
        })
    }

    /// Builds every partition of `space`, in order.
    pub async fn run(&mut self, space: &PartitionSpace) -> Result<RunSummary, OrchestratorError> {
        let start = Instant::now();

        tracing::info!(
            run_id = self.run_id,
            year_start = space.years().start(),
            year_end = space.years().end(),
            overwrite = self.overwrite,
            atomic_partitions = self.atomic_partitions,
            obt = %self.tables.obt,
            "obt_build_started"
        );

        schema::ensure_table(self.conn, &self.tables)
            .await
            .map_err(OrchestratorError::Schema)?;
        schema::ensure_ledger(self.conn, &self.tables)
            .await
            .map_err(OrchestratorError::Schema)?;

        let mut summary = RunSummary::default();

        for partition in space.iter() {
            let plan = planner::plan(self.conn, &self.tables, partition, self.overwrite)
                .await
                .map_err(OrchestratorError::Plan)?;

            let purge = match plan.decision {
                Decision::Skip(reason) => {
                    tracing::info!(
                        service = %partition.service,
                        year = partition.year,
                        month = partition.month.get(),
                        existing_rows = plan.existing_rows,
                        reason = reason.as_str(),
                        "partition_skipped"
                    );
                    summary.skipped += 1;
                    continue;
                }
                Decision::PurgeAndLoad => true,
                Decision::Load => false,
            };

            tracing::info!(
                service = %partition.service,
                year = partition.year,
                month = partition.month.get(),
                existing_rows = plan.existing_rows,
                decision = plan.decision.as_str(),
                "partition_started"
            );

            let outcome = if self.atomic_partitions {
                self.process_atomic(partition, purge).await?
            } else {
                self.process(partition, purge).await?
            };

            match outcome {
                Outcome::Loaded { rows, purged_rows } => {
                    summary.loaded += 1;
                    summary.rows_inserted += rows;
                    summary.record_purge(purged_rows);
                }
                Outcome::Failed { purged_rows } => {
                    summary.failed += 1;
                    summary.failed_partitions.push(partition);
                    summary.record_purge(purged_rows);
                }
            }
        }

        if summary.rows_inserted > 0 {
            summary.optimize = Some(optimizer::optimize(self.conn, &self.tables).await);
        } else {
            tracing::info!("no_rows_inserted_skipping_optimize");
        }

        summary.elapsed = start.elapsed();

        tracing::info!(
            run_id = self.run_id,
            loaded = summary.loaded,
            skipped = summary.skipped,
            purged = summary.purged,
            failed = summary.failed,
            rows_inserted = summary.rows_inserted,
            rows_purged = summary.rows_purged,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "run_summary"
        );

        Ok(summary)
    }

    /// Purge (if asked) and load in autocommit mode.
    ///
    /// A failure after the purge leaves the key empty and the ledger not `COMPLETED`, so the next
    /// run loads it again.
    async fn process(
        &mut self,
        partition: Partition,
        purge: bool,
    ) -> Result<Outcome, OrchestratorError> {
        let purged_rows = if purge {
            self.mark(partition, LedgerStatus::Purged, None, None).await;
            let deleted = planner::purge(&mut *self.conn, &self.tables, partition)
                .await
                .map_err(OrchestratorError::Purge)?;
            log_purged(partition, deleted);
            Some(deleted)
        } else {
            None
        };

        self.mark(partition, LedgerStatus::Running, None, None).await;

        match loader::load(self.conn, &self.tables, partition).await {
            Ok(report) => {
                self.mark(partition, LedgerStatus::Completed, Some(report.rows), None).await;
                Ok(Outcome::Loaded {
                    rows: report.rows,
                    purged_rows,
                })
            }
            Err(err) => {
                log_load_failed(partition, &err);
                let message = error_message(&err);
                self.mark(partition, LedgerStatus::Failed, None, Some(message)).await;
                Ok(Outcome::Failed { purged_rows })
            }
        }
    }

    /// Purge (if asked) and load inside one transaction.
    ///
    /// On a failed load the transaction is rolled back, restoring any purged rows.
    async fn process_atomic(
        &mut self,
        partition: Partition,
        purge: bool,
    ) -> Result<Outcome, OrchestratorError> {
        self.mark(partition, LedgerStatus::Running, None, None).await;

        let mut tx = self
            .conn
            .begin()
            .await
            .map_err(|source| OrchestratorError::BeginTransaction { partition, source })?;

        let purged_rows = if purge {
            match planner::purge(&mut *tx, &self.tables, partition).await {
                Ok(deleted) => Some(deleted),
                Err(err) => {
                    rollback(tx, partition).await;
                    let message = error_message(&err);
                    self.mark(partition, LedgerStatus::Failed, None, Some(message)).await;
                    return Err(OrchestratorError::Purge(err));
                }
            }
        } else {
            None
        };

        let report = match loader::load(&mut tx, &self.tables, partition).await {
            Ok(report) => report,
            Err(err) => {
                log_load_failed(partition, &err);
                rollback(tx, partition).await;
                let message = error_message(&err);
                self.mark(partition, LedgerStatus::Failed, None, Some(message)).await;
                return Ok(Outcome::Failed { purged_rows: None });
            }
        };

        if let Err(err) = tx.commit().await {
            tracing::error!(
                service = %partition.service,
                year = partition.year,
                month = partition.month.get(),
                error = %err,
                error_source = %monitoring::logging::error_source(&err),
                "partition_commit_failed"
            );
            let message = error_message(&err);
            self.mark(partition, LedgerStatus::Failed, None, Some(message)).await;
            return Ok(Outcome::Failed { purged_rows: None });
        }

        if let Some(deleted) = purged_rows {
            log_purged(partition, deleted);
        }
        self.mark(partition, LedgerStatus::Completed, Some(report.rows), None).await;

        Ok(Outcome::Loaded {
            rows: report.rows,
            purged_rows,
        })
    }

    /// Best-effort ledger write.
    async fn mark(
        &mut self,
        partition: Partition,
        status: LedgerStatus,
        row_count: Option<i64>,
        error: Option<String>,
    ) {
        if let Err(err) = ledger::record(
            &mut *self.conn,
            &self.tables,
            partition,
            status,
            self.run_id,
            row_count,
            error.as_deref(),
        )
        .await
        {
            tracing::warn!(
                %partition,
                status = %status,
                error = %err,
                error_source = %monitoring::logging::error_source(&err),
                "ledger_write_failed"
            );
        }
    }
}

impl RunSummary {
    fn record_purge(&mut self, purged_rows: Option<u64>) {
        if let Some(rows) = purged_rows {
            self.purged += 1;
            self.rows_purged += rows;
        }
    }
}

/// Top-level message plus source chain, as stored in the ledger.
fn error_message(err: &(dyn std::error::Error + 'static)) -> String {
    let source = monitoring::logging::error_source(err);
    if source.is_empty() {
        err.to_string()
    } else {
        format!("{err}: {source}")
    }
}

async fn rollback(tx: sqlx::Transaction<'_, sqlx::Postgres>, partition: Partition) {
    if let Err(err) = tx.rollback().await {
        tracing::warn!(
            %partition,
            error = %err,
            error_source = %monitoring::logging::error_source(&err),
            "partition_rollback_failed"
        );
    }
}

fn log_purged(partition: Partition, deleted: u64) {
    tracing::info!(
        service = %partition.service,
        year = partition.year,
        month = partition.month.get(),
        rows_deleted = deleted,
        "partition_purged"
    );
}

fn log_load_failed(partition: Partition, err: &LoadError) {
    tracing::error!(
        service = %partition.service,
        year = partition.year,
        month = partition.month.get(),
        error = %err,
        error_source = %monitoring::logging::error_source(err),
        "partition_load_failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purges_are_only_counted_when_they_stick() {
        let mut summary = RunSummary::default();

        summary.record_purge(None);
        summary.record_purge(Some(500));
        summary.record_purge(Some(0));

        assert_eq!(summary.purged, 2);
        assert_eq!(summary.rows_purged, 500);
    }
}
