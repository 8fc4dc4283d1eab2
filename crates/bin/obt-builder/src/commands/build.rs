use anyhow::{Context, Result};
use tracing::info;

use crate::{
    config::Config,
    conn::Session,
    orchestrator::{Orchestrator, RunSummary},
};

/// Builds the OBT for the configured partitions.
///
/// The session is closed on every exit path once it is open, including a failed run.
pub async fn run(config: Config) -> Result<RunSummary> {
    info!(run_id = %config.run_id, mode = ?config.mode, "Starting obt-builder");

    config.validate().context("Invalid configuration")?;
    let space = config.partition_space();

    let mut session = Session::connect(&config)
        .await
        .context("Failed to connect to database")?;
    info!(
        host = %config.pg_host,
        database = %config.pg_database,
        "Database connection established"
    );

    let result = match Orchestrator::new(&config, &mut session) {
        Ok(mut orchestrator) => orchestrator.run(&space).await,
        Err(err) => Err(err),
    };

    if let Err(err) = session.close().await {
        tracing::warn!(
            error = %err,
            error_source = %monitoring::logging::error_source(&err),
            "db_session_close_failed"
        );
    }

    let summary = result.context("OBT build failed")?;
    info!(
        loaded = summary.loaded,
        failed = summary.failed,
        "OBT build complete"
    );

    Ok(summary)
}
